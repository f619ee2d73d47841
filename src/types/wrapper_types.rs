//! Common type aliases.

use std::future::Future;
use std::pin::Pin;

/// A boxed, pinned, `Send` future.
///
/// Lets object-safe traits such as `Transport` expose async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
