//! The tree of named namespaces that organizes dimensions, variables and attributes.
//!
use std::io::{Read, Write};

use crate::{
    attribute::AttributeStore,
    dimension::DimensionId,
    errors::{Error, Result},
    extio::{capacity, ExtendedRead, ExtendedWrite, Serialize},
    schema::Schema,
    variable::VariableId,
};

/// Index of a group in a dataset's schema
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub(crate) usize);

impl GroupId {
    /// The root group, which always exists
    pub const ROOT: GroupId = GroupId(0);

    pub fn index(&self) -> usize {
        self.0
    }
}

/// A namespace node in a dataset's hierarchy
///
#[derive(Clone, Debug, PartialEq)]
pub struct Group {
    pub(crate) name: String,
    pub(crate) parent: Option<GroupId>,
    pub(crate) children: Vec<GroupId>,
    pub(crate) dimensions: Vec<DimensionId>,
    pub(crate) variables: Vec<VariableId>,
    pub(crate) attributes: AttributeStore,
}

impl Group {
    pub(crate) fn new(name: String, parent: Option<GroupId>) -> Self {
        Self {
            name,
            parent,
            children: vec![],
            dimensions: vec![],
            variables: vec![],
            attributes: AttributeStore::new(),
        }
    }

    /// The group's name. The root group's name is empty.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<GroupId> {
        self.parent
    }

    pub fn children(&self) -> &[GroupId] {
        &self.children
    }

    /// Dimensions defined directly in this group, in definition order
    pub fn dimensions(&self) -> &[DimensionId] {
        &self.dimensions
    }

    /// Variables defined directly in this group, in definition order
    pub fn variables(&self) -> &[VariableId] {
        &self.variables
    }

    pub fn attributes(&self) -> &AttributeStore {
        &self.attributes
    }
}

impl Serialize for Group {
    fn write_to(&self, stream: &mut impl Write) -> Result<()> {
        stream.write_string(&self.name)?;
        match self.parent {
            Some(parent) => {
                stream.write_bool(true)?;
                stream.write_usize(parent.0)?;
            }
            None => stream.write_bool(false)?,
        }
        write_ids(stream, self.children.iter().map(|id| id.0))?;
        write_ids(stream, self.dimensions.iter().map(|id| id.0))?;
        write_ids(stream, self.variables.iter().map(|id| id.0))?;
        self.attributes.write_to(stream)?;

        Ok(())
    }

    fn read_from(stream: &mut impl Read) -> Result<Self> {
        let name = stream.read_string()?;
        let parent = if stream.read_bool()? {
            Some(GroupId(stream.read_usize()?))
        } else {
            None
        };
        let children = read_ids(stream)?.into_iter().map(GroupId).collect();
        let dimensions = read_ids(stream)?.into_iter().map(DimensionId).collect();
        let variables = read_ids(stream)?.into_iter().map(VariableId).collect();
        let attributes = AttributeStore::read_from(stream)?;

        Ok(Self {
            name,
            parent,
            children,
            dimensions,
            variables,
            attributes,
        })
    }
}

pub(crate) fn write_ids(
    stream: &mut impl Write,
    ids: impl ExactSizeIterator<Item = usize>,
) -> Result<()> {
    stream.write_usize(ids.len())?;
    for id in ids {
        stream.write_usize(id)?;
    }

    Ok(())
}

pub(crate) fn read_ids(stream: &mut impl Read) -> Result<Vec<usize>> {
    let count = stream.read_usize()?;
    let mut ids = Vec::with_capacity(capacity(count));
    for _ in 0..count {
        ids.push(stream.read_usize()?);
    }

    Ok(ids)
}

/// Names of groups, dimensions, variables and attributes must be non-empty and may not contain
/// a slash.
///
pub(crate) fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        Err(Error::InvalidArgument(String::from("name may not be empty")))
    } else if name.contains('/') {
        Err(Error::InvalidArgument(format!("name may not contain '/': {name}")))
    } else {
        Ok(())
    }
}

impl Schema {
    pub(crate) fn group(&self, id: GroupId) -> Result<&Group> {
        self.groups
            .get(id.0)
            .ok_or_else(|| Error::PathNotFound(format!("no group with index {}", id.0)))
    }

    pub(crate) fn group_mut(&mut self, id: GroupId) -> Result<&mut Group> {
        self.groups
            .get_mut(id.0)
            .ok_or_else(|| Error::PathNotFound(format!("no group with index {}", id.0)))
    }

    /// Define a new group as the last child of `parent`
    ///
    pub(crate) fn define_group(&mut self, parent: GroupId, name: &str) -> Result<GroupId> {
        if self.classic_model {
            return Err(Error::ClassicModel(String::from("groups are not supported")));
        }
        check_name(name)?;
        if self.child(parent, name)?.is_some() {
            return Err(Error::DuplicateName(name.to_string()));
        }

        let id = GroupId(self.groups.len());
        self.groups.push(Group::new(name.to_string(), Some(parent)));
        self.group_mut(parent)?.children.push(id);

        Ok(id)
    }

    fn child(&self, parent: GroupId, name: &str) -> Result<Option<GroupId>> {
        let group = self.group(parent)?;

        Ok(group
            .children
            .iter()
            .copied()
            .find(|child| self.groups[child.0].name == name))
    }

    /// Resolve a slash separated path to a group.
    ///
    /// # Arguments
    ///
    /// * `from` - The group relative paths are resolved against.
    /// * `path` - An absolute path, starting at the root group with `/`, or a path relative to
    ///   `from`. The components `.` and `..` refer to the current and the parent group.
    ///
    pub(crate) fn resolve_path(&self, from: GroupId, path: &str) -> Result<GroupId> {
        let mut current = if path.starts_with('/') {
            GroupId::ROOT
        } else {
            self.group(from)?;
            from
        };

        for component in path.split('/') {
            current = match component {
                "" | "." => current,
                ".." => self.groups[current.0]
                    .parent
                    .ok_or_else(|| Error::PathNotFound(path.to_string()))?,
                name => self
                    .child(current, name)?
                    .ok_or_else(|| Error::PathNotFound(path.to_string()))?,
            };
        }

        Ok(current)
    }

    /// The absolute path of a group. The root group is `/`.
    ///
    pub(crate) fn full_name(&self, id: GroupId) -> Result<String> {
        let mut names = vec![];
        let mut current = self.group(id)?;
        while let Some(parent) = current.parent {
            names.push(current.name.as_str());
            current = &self.groups[parent.0];
        }
        names.reverse();

        Ok(format!("/{}", names.join("/")))
    }

    pub(crate) fn rename_group(&mut self, id: GroupId, name: &str) -> Result<()> {
        check_name(name)?;
        let parent = self
            .group(id)?
            .parent
            .ok_or_else(|| Error::InvalidArgument(String::from("cannot rename root group")))?;
        match self.child(parent, name)? {
            Some(existing) if existing != id => Err(Error::DuplicateName(name.to_string())),
            _ => {
                self.group_mut(id)?.name = name.to_string();
                Ok(())
            }
        }
    }

    /// The group followed by its ancestors, up to the root group
    ///
    pub(crate) fn lineage(&self, id: GroupId) -> Result<Vec<GroupId>> {
        let mut lineage = vec![id];
        let mut current = self.group(id)?;
        while let Some(parent) = current.parent {
            lineage.push(parent);
            current = &self.groups[parent.0];
        }

        Ok(lineage)
    }
}
