//! Hierarchical, chunked, self-describing array datasets.
//!
//! A dataset is a tree of groups holding named dimensions, typed n-dimensional variables and
//! attributes, persisted to a pluggable `BlockStore`. See `Dataset` for the entry point.
//!
mod attribute;
mod cache;
mod codec;
mod dataset;
mod dimension;
mod errors;
mod extio;
mod geom;
mod group;
mod io;
mod resolver;
mod schema;
mod session;
mod store;
mod types;
mod variable;

#[cfg(test)]
mod testing;

pub use attribute::Attribute;
pub use attribute::AttributeStore;
pub use attribute::AttributeValue;
pub use attribute::Scope;
pub use attribute::FILL_VALUE;
pub use cache::CachePolicy;
pub use codec::CodecRegistry;
pub use codec::Filters;
pub use codec::StandardCodecs;
pub use dataset::Dataset;
pub use dataset::Inquiry;
pub use dimension::Dimension;
pub use dimension::DimensionId;
pub use dimension::Length;
pub use errors::Error;
pub use errors::Result;
pub use geom::Selection;
pub use group::Group;
pub use group::GroupId;
pub use io::CancelHandle;
pub use session::Config;
pub use session::FillMode;
pub use session::Format;
pub use session::Mode;
pub use store::BlockId;
pub use store::BlockStore;
pub use store::MemoryStore;
pub use types::default_fill_value;
pub use types::width_of;
pub use types::Element;
pub use types::Endianness;
pub use types::NcType;
pub use variable::Storage;
pub use variable::Variable;
pub use variable::VariableId;

/// The library version string
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
