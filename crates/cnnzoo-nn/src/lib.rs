pub mod init;
pub mod layers;
pub mod conv;
pub mod sequential;

pub use conv::*;
pub use layers::*;
pub use sequential::*;
