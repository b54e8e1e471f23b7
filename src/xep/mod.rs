//! Small numbered extensions.
//!
//! One module per XEP, named by number the way the server side of this
//! family of projects lays them out.

pub mod xep0054;
pub mod xep0055;
pub mod xep0077;
pub mod xep0085;
pub mod xep0092;
pub mod xep0191;
pub mod xep0199;
pub mod xep0202;
pub mod xep0224;
pub mod xep0280;
pub mod xep0363;

pub use xep0054::VCard;
pub use xep0055::Search;
pub use xep0077::Registration;
pub use xep0085::{ChatState, ChatStates};
pub use xep0092::{SoftwareVersion, Version};
pub use xep0191::Blocking;
pub use xep0199::Ping;
pub use xep0202::EntityTime;
pub use xep0224::Attention;
pub use xep0280::Carbons;
pub use xep0363::{HttpUpload, UploadSlot};
