//! The logical schema of a dataset: flat tables of groups, dimensions and variables, linked by
//! index.
//!
use std::io::{Read, Write};

use crate::{
    attribute::{AttributeStore, AttributeValue, Scope, FILL_VALUE},
    dimension::Dimension,
    errors::{Error, Result},
    extio::{capacity, ExtendedRead, ExtendedWrite, Serialize},
    group::{check_name, Group},
    variable::{check_fill_value, Variable},
};

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Schema {
    /// Restrict the schema to what the classic data model can express
    pub classic_model: bool,

    /// The root group is always the first group
    pub groups: Vec<Group>,
    pub dimensions: Vec<Dimension>,
    pub variables: Vec<Variable>,
}

impl Schema {
    pub fn new(classic_model: bool) -> Self {
        Self {
            classic_model,
            groups: vec![Group::new(String::new(), None)],
            dimensions: vec![],
            variables: vec![],
        }
    }

    pub fn attributes(&self, scope: Scope) -> Result<&AttributeStore> {
        match scope {
            Scope::Group(id) => Ok(&self.group(id)?.attributes),
            Scope::Variable(id) => Ok(&self.variable(id)?.attributes),
        }
    }

    fn attributes_mut(&mut self, scope: Scope) -> Result<&mut AttributeStore> {
        match scope {
            Scope::Group(id) => Ok(&mut self.group_mut(id)?.attributes),
            Scope::Variable(id) => Ok(&mut self.variable_mut(id)?.attributes),
        }
    }

    /// Changing a variable's fill value is a change to its storage properties
    ///
    fn check_fill_change(&mut self, scope: Scope) -> Result<()> {
        if let Scope::Variable(id) = scope {
            let variable = self.variable_mut(id)?;
            variable.check_not_written()?;
            variable.layout_stale = true;
        }

        Ok(())
    }

    pub fn put_attribute(&mut self, scope: Scope, name: &str, value: AttributeValue) -> Result<()> {
        check_name(name)?;
        if self.classic_model && !value.dtype().is_classic() {
            return Err(Error::ClassicModel(format!(
                "attribute type {} is not supported",
                value.dtype()
            )));
        }
        if name == FILL_VALUE {
            if let Scope::Variable(id) = scope {
                check_fill_value(self.variable(id)?, &value)?;
            }
            self.check_fill_change(scope)?;
        }
        self.attributes_mut(scope)?.put(name, value);

        Ok(())
    }

    pub fn delete_attribute(&mut self, scope: Scope, name: &str) -> Result<AttributeValue> {
        self.attributes(scope)?.get(name)?;
        if name == FILL_VALUE {
            self.check_fill_change(scope)?;
        }

        self.attributes_mut(scope)?.delete(name)
    }

    pub fn rename_attribute(&mut self, scope: Scope, old: &str, new: &str) -> Result<()> {
        check_name(new)?;
        let value = self.attributes(scope)?.get(old)?;
        if new == FILL_VALUE {
            if let Scope::Variable(id) = scope {
                check_fill_value(self.variable(id)?, value)?;
            }
        }
        if old != new && (old == FILL_VALUE || new == FILL_VALUE) {
            self.check_fill_change(scope)?;
        }

        self.attributes_mut(scope)?.rename(old, new)
    }

    /// Copy an attribute from one scope to another, replacing any attribute of the same name.
    ///
    pub fn copy_attribute(&mut self, source: Scope, name: &str, destination: Scope) -> Result<()> {
        let value = self.attributes(source)?.get(name)?.clone();

        self.put_attribute(destination, name, value)
    }

    /// Fail with a format error if any index in the schema points nowhere, or if the group
    /// tree is not a tree.
    ///
    fn check_references(&self) -> Result<()> {
        let bad = |what: &str| Err(Error::Format(format!("dangling {what} reference")));
        if self.groups.is_empty() || self.groups[0].parent.is_some() {
            return bad("root group");
        }
        for group in &self.groups {
            if group.parent.map_or(false, |id| id.0 >= self.groups.len())
                || group.children.iter().any(|id| id.0 >= self.groups.len())
            {
                return bad("group");
            }
            if group.dimensions.iter().any(|id| id.0 >= self.dimensions.len()) {
                return bad("dimension");
            }
            if group.variables.iter().any(|id| id.0 >= self.variables.len()) {
                return bad("variable");
            }
        }
        for start in 1..self.groups.len() {
            let mut current = start;
            let mut steps = 0;
            while current != 0 {
                match self.groups[current].parent {
                    Some(parent) if steps < self.groups.len() => current = parent.0,
                    _ => return Err(Error::Format(format!("group {start} is not under the root"))),
                }
                steps += 1;
            }
        }
        for dimension in &self.dimensions {
            if dimension.group.0 >= self.groups.len() {
                return bad("group");
            }
        }
        for variable in &self.variables {
            if variable.group.0 >= self.groups.len() {
                return bad("group");
            }
            if variable
                .dimensions
                .iter()
                .any(|id| id.0 >= self.dimensions.len())
            {
                return bad("dimension");
            }
        }

        Ok(())
    }
}

impl Serialize for Schema {
    fn write_to(&self, stream: &mut impl Write) -> Result<()> {
        stream.write_bool(self.classic_model)?;
        stream.write_usize(self.groups.len())?;
        for group in &self.groups {
            group.write_to(stream)?;
        }
        stream.write_usize(self.dimensions.len())?;
        for dimension in &self.dimensions {
            dimension.write_to(stream)?;
        }
        stream.write_usize(self.variables.len())?;
        for variable in &self.variables {
            variable.write_to(stream)?;
        }

        Ok(())
    }

    fn read_from(stream: &mut impl Read) -> Result<Self> {
        let classic_model = stream.read_bool()?;
        let count = stream.read_usize()?;
        let mut groups = Vec::with_capacity(capacity(count));
        for _ in 0..count {
            groups.push(Group::read_from(stream)?);
        }
        let count = stream.read_usize()?;
        let mut dimensions = Vec::with_capacity(capacity(count));
        for _ in 0..count {
            dimensions.push(Dimension::read_from(stream)?);
        }
        let count = stream.read_usize()?;
        let mut variables = Vec::with_capacity(capacity(count));
        for _ in 0..count {
            variables.push(Variable::read_from(stream)?);
        }

        let schema = Self {
            classic_model,
            groups,
            dimensions,
            variables,
        };
        schema.check_references()?;

        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    use crate::{dimension::Length, group::GroupId, types::NcType};

    #[test]
    fn test_attributes() -> Result<()> {
        let mut schema = Schema::new(false);
        let x = schema.define_dimension(GroupId::ROOT, "x", Length::Fixed(3))?;
        let v = schema.define_variable(GroupId::ROOT, "v", NcType::Int, &[x], false)?;

        schema.put_attribute(Scope::GLOBAL, "title", "test".into())?;
        schema.put_attribute(v.into(), "units", "m".into())?;
        schema.put_attribute(v.into(), "scale", vec![2.0_f64].into())?;

        assert_eq!(schema.attributes(Scope::GLOBAL)?.names(), vec!["title"]);
        assert_eq!(schema.attributes(v.into())?.names(), vec!["units", "scale"]);

        schema.copy_attribute(v.into(), "units", Scope::GLOBAL)?;
        assert_eq!(schema.attributes(Scope::GLOBAL)?.get("units")?.as_text(), Some("m"));

        schema.rename_attribute(Scope::GLOBAL, "units", "unit")?;
        assert_eq!(schema.attributes(Scope::GLOBAL)?.names(), vec!["title", "unit"]);

        schema.delete_attribute(Scope::GLOBAL, "title")?;
        assert!(matches!(
            schema.delete_attribute(Scope::GLOBAL, "title"),
            Err(Error::AttributeNotFound(_))
        ));

        Ok(())
    }

    #[test]
    fn test_fill_value_attribute() -> Result<()> {
        let mut schema = Schema::new(false);
        let x = schema.define_dimension(GroupId::ROOT, "x", Length::Fixed(3))?;
        let v = schema.define_variable(GroupId::ROOT, "v", NcType::Int, &[x], false)?;

        assert!(matches!(
            schema.put_attribute(v.into(), FILL_VALUE, vec![1.0_f32].into()),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(matches!(
            schema.put_attribute(v.into(), FILL_VALUE, vec![1_i32, 2].into()),
            Err(Error::ShapeMismatch(_))
        ));
        schema.put_attribute(v.into(), FILL_VALUE, vec![-1_i32].into())?;
        assert_eq!(schema.variable(v)?.fill_value(), AttributeValue::I32(vec![-1]));

        schema.variable_mut(v)?.written = true;
        assert!(matches!(
            schema.put_attribute(v.into(), FILL_VALUE, vec![-2_i32].into()),
            Err(Error::AlreadyFinalized(_))
        ));
        assert!(matches!(
            schema.delete_attribute(v.into(), FILL_VALUE),
            Err(Error::AlreadyFinalized(_))
        ));
        assert!(matches!(
            schema.rename_attribute(v.into(), FILL_VALUE, "old_fill"),
            Err(Error::AlreadyFinalized(_))
        ));

        // Other attributes may still change
        schema.put_attribute(v.into(), "units", "K".into())?;

        // A global _FillValue is just an attribute
        schema.put_attribute(Scope::GLOBAL, FILL_VALUE, vec![1.0_f64, 2.0].into())?;

        Ok(())
    }

    #[test]
    fn test_classic_attribute_types() -> Result<()> {
        let mut schema = Schema::new(true);
        schema.put_attribute(Scope::GLOBAL, "ok", vec![1_i16].into())?;
        assert!(matches!(
            schema.put_attribute(Scope::GLOBAL, "big", vec![1_u64].into()),
            Err(Error::ClassicModel(_))
        ));

        Ok(())
    }

    #[test]
    fn test_serialize() -> Result<()> {
        let mut schema = Schema::new(false);
        let time = schema.define_dimension(GroupId::ROOT, "time", Length::Unlimited)?;
        let child = schema.define_group(GroupId::ROOT, "child")?;
        let x = schema.define_dimension(child, "x", Length::Fixed(4))?;
        let v = schema.define_variable(child, "v", NcType::String, &[time, x], false)?;
        schema.put_attribute(Scope::GLOBAL, "history", "created".into())?;
        schema.put_attribute(v.into(), "long_name", "value".into())?;
        schema.variable_mut(v)?.layout_stale = false;

        let mut buffer: Vec<u8> = vec![];
        schema.write_to(&mut buffer)?;
        let loaded = Schema::read_from(&mut Cursor::new(buffer))?;
        assert_eq!(loaded, schema);

        Ok(())
    }

    #[test]
    fn test_dangling_reference() -> Result<()> {
        let mut schema = Schema::new(false);
        schema.groups[0].children.push(GroupId(7));

        let mut buffer: Vec<u8> = vec![];
        schema.write_to(&mut buffer)?;
        assert!(matches!(
            Schema::read_from(&mut Cursor::new(buffer)),
            Err(Error::Format(_))
        ));

        Ok(())
    }

    #[test]
    fn test_group_cycle() -> Result<()> {
        let load = |schema: &Schema| -> Result<Schema> {
            let mut buffer: Vec<u8> = vec![];
            schema.write_to(&mut buffer)?;
            Schema::read_from(&mut Cursor::new(buffer))
        };

        let mut schema = Schema::new(false);
        let a = schema.define_group(GroupId::ROOT, "a")?;
        let b = schema.define_group(a, "b")?;
        assert_eq!(load(&schema)?, schema);

        let mut cyclic = schema.clone();
        cyclic.groups[a.0].parent = Some(b);
        assert!(matches!(load(&cyclic), Err(Error::Format(_))));

        let mut looped = schema.clone();
        looped.groups[b.0].parent = Some(b);
        assert!(matches!(load(&looped), Err(Error::Format(_))));

        let mut orphan = schema;
        orphan.groups[b.0].parent = None;
        assert!(matches!(load(&orphan), Err(Error::Format(_))));

        Ok(())
    }
}
