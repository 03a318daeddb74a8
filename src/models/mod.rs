pub mod evidence;
pub mod keyword;
pub mod profile;
pub mod recommendation;

pub use evidence::*;
pub use keyword::*;
pub use profile::*;
pub use recommendation::*;
