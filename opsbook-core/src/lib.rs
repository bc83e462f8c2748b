#![forbid(unsafe_code)]

pub mod book;
pub mod error;
pub mod expr;
pub mod step;
pub mod store;

pub use crate::book::{load_book, parse_book_str, Book, BookError, BookFormat};
pub use crate::error::{ConfigError, ParseError};
pub use crate::expr::{Env, ExprError, Func, FuncMap};
pub use crate::step::{Step, StepKind};
pub use crate::store::Store;
