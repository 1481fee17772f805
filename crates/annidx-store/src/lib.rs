pub mod bimap;
pub mod byte_store;
pub mod descriptor_store;

pub use bimap::Bimap;
pub use byte_store::{ByteStore, FileByteStore, InMemoryByteStore};
pub use descriptor_store::DescriptorStore;
