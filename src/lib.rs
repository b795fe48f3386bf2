pub mod encoding;
pub mod error;
pub mod fio;
pub mod table;
pub mod writeonce;

pub use error::{Error, Result};
pub use table::{backend, open, Backend, OpenMode, Table, TableFlag, TableOptions};
pub use writeonce::{Compression, WriteOnceTable};
