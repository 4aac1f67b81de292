//! Named, sized axes.
//!
use std::io::{Read, Write};

use crate::{
    errors::{Error, Result},
    extio::{ExtendedRead, ExtendedWrite, Serialize},
    group::{check_name, GroupId},
    schema::Schema,
};

/// Index of a dimension in a dataset's schema
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DimensionId(pub(crate) usize);

impl DimensionId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// The declared length of a dimension
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Length {
    Fixed(usize),

    /// Grows to cover the highest index written by any variable that uses the dimension
    Unlimited,
}

impl TryFrom<i64> for Length {
    type Error = Error;

    fn try_from(length: i64) -> Result<Self> {
        usize::try_from(length)
            .map(Length::Fixed)
            .map_err(|_| Error::InvalidLength(length))
    }
}

impl From<usize> for Length {
    fn from(length: usize) -> Self {
        Length::Fixed(length)
    }
}

/// A named axis
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dimension {
    pub(crate) name: String,
    pub(crate) group: GroupId,
    pub(crate) unlimited: bool,
    pub(crate) length: usize,
}

impl Dimension {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The group the dimension was defined in
    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn is_unlimited(&self) -> bool {
        self.unlimited
    }

    /// Current length. For an unlimited dimension this is the highest index written so far,
    /// plus one.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl Serialize for Dimension {
    fn write_to(&self, stream: &mut impl Write) -> Result<()> {
        stream.write_string(&self.name)?;
        stream.write_usize(self.group.0)?;
        stream.write_bool(self.unlimited)?;
        stream.write_usize(self.length)?;

        Ok(())
    }

    fn read_from(stream: &mut impl Read) -> Result<Self> {
        Ok(Self {
            name: stream.read_string()?,
            group: GroupId(stream.read_usize()?),
            unlimited: stream.read_bool()?,
            length: stream.read_usize()?,
        })
    }
}

impl Schema {
    pub(crate) fn dimension(&self, id: DimensionId) -> Result<&Dimension> {
        self.dimensions
            .get(id.0)
            .ok_or_else(|| Error::DimensionNotFound(format!("no dimension with index {}", id.0)))
    }

    pub(crate) fn dimension_mut(&mut self, id: DimensionId) -> Result<&mut Dimension> {
        self.dimensions
            .get_mut(id.0)
            .ok_or_else(|| Error::DimensionNotFound(format!("no dimension with index {}", id.0)))
    }

    /// Define a new dimension in `group`.
    ///
    /// In the classic model a group may have at most one unlimited dimension.
    ///
    pub(crate) fn define_dimension(
        &mut self,
        group: GroupId,
        name: &str,
        length: Length,
    ) -> Result<DimensionId> {
        check_name(name)?;
        let owner = self.group(group)?;
        if self.own_dimension(owner.dimensions.as_slice(), name).is_some() {
            return Err(Error::DuplicateName(name.to_string()));
        }
        if self.classic_model && length == Length::Unlimited && !self.unlimited(group)?.is_empty() {
            return Err(Error::ClassicModel(String::from(
                "only one unlimited dimension is allowed",
            )));
        }

        let (unlimited, length) = match length {
            Length::Fixed(length) => (false, length),
            Length::Unlimited => (true, 0),
        };
        let id = DimensionId(self.dimensions.len());
        self.dimensions.push(Dimension {
            name: name.to_string(),
            group,
            unlimited,
            length,
        });
        self.group_mut(group)?.dimensions.push(id);

        Ok(id)
    }

    fn own_dimension(&self, ids: &[DimensionId], name: &str) -> Option<DimensionId> {
        ids.iter()
            .copied()
            .find(|id| self.dimensions[id.0].name == name)
    }

    /// Find a dimension by name, searching `group` and then its ancestors.
    ///
    pub(crate) fn lookup_dimension(&self, group: GroupId, name: &str) -> Result<DimensionId> {
        for id in self.lineage(group)? {
            if let Some(dimension) = self.own_dimension(&self.groups[id.0].dimensions, name) {
                return Ok(dimension);
            }
        }

        Err(Error::DimensionNotFound(name.to_string()))
    }

    pub(crate) fn rename_dimension(&mut self, id: DimensionId, name: &str) -> Result<()> {
        check_name(name)?;
        let group = self.dimension(id)?.group;
        match self.own_dimension(&self.groups[group.0].dimensions, name) {
            Some(existing) if existing != id => Err(Error::DuplicateName(name.to_string())),
            _ => {
                self.dimension_mut(id)?.name = name.to_string();
                Ok(())
            }
        }
    }

    /// Unlimited dimensions defined directly in `group`
    ///
    pub(crate) fn unlimited(&self, group: GroupId) -> Result<Vec<DimensionId>> {
        Ok(self
            .group(group)?
            .dimensions
            .iter()
            .copied()
            .filter(|id| self.dimensions[id.0].unlimited)
            .collect())
    }

    /// Every dimension visible from `group`: its own, followed by those of its ancestors that
    /// are not shadowed by a nearer dimension of the same name.
    ///
    pub(crate) fn visible_dimensions(&self, group: GroupId) -> Result<Vec<DimensionId>> {
        let mut visible: Vec<DimensionId> = vec![];
        for id in self.lineage(group)? {
            for dimension in &self.groups[id.0].dimensions {
                let name = &self.dimensions[dimension.0].name;
                if !visible
                    .iter()
                    .any(|seen| &self.dimensions[seen.0].name == name)
                {
                    visible.push(*dimension);
                }
            }
        }

        Ok(visible)
    }
}
