mod descriptor;
mod error;

pub use descriptor::{
    DescriptorSource, RawDescriptor, ServerDescriptor, StaticDescriptorSource, TransportKind,
    parse_descriptors,
};
pub use error::DescriptorError;
