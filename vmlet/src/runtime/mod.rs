pub mod image;
pub mod layout;
pub mod options;
mod recovery;
mod service;
pub mod types;
pub mod vmtool;

pub use image::{IdentityTranslator, ImageStore, ImageTranslator};
pub use options::{NetdOptions, RuntimeOptions};
pub use recovery::recover_networks;
pub use service::RuntimeService;
pub use vmtool::VmTool;
