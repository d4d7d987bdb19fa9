//! Wire format: header, buffer extraction and message packing.

pub mod buffers;
pub mod header;
pub mod packer;

pub use self::buffers::{Extracted, extract, placeholder_count, restore};
pub use self::header::{Header, MessageKind};
pub use self::packer::{PackedMessage, Packer, Unpacked};
