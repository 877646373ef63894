//! Production `Runtime` implementation. See [`common::runtime::Runtime`].
pub mod prod;

#[cfg(any(test, feature = "testing"))]
pub use ::common::runtime::testing;
