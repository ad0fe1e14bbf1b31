pub mod dataclip;
pub mod query_result;
pub mod settings;

pub use dataclip::*;
pub use query_result::*;
pub use settings::*;
