//! Repeats a lookup once if it yielded stale data.
//!
//! Derived caches (like the [AffinityCache](crate::affinity::AffinityCache)) might hand out an
//! entry which turns out to be expired. Instead of checking this at each call site, the lookup is
//! wrapped in [retry_if_expired](retry_if_expired): if the first result reports itself as
//! expired, the provider is invoked exactly once more and whatever it yields is returned, even if
//! that is expired again. An optional hook runs in between, which is commonly used to evict the
//! stale entry so that the second call fetches a fresh one.
//!
//! # Example
//!
//! ```
//! # use ganymede::retry::{retry_if_expired, Expirable};
//! struct Lease {
//!     remaining: u32,
//! }
//!
//! impl Expirable for Lease {
//!     fn is_expired(&self) -> bool {
//!         self.remaining == 0
//!     }
//! }
//!
//! let mut leases = vec![Lease { remaining: 10 }, Lease { remaining: 0 }];
//! let lease = retry_if_expired(|| leases.pop());
//! assert_eq!(lease.map(|lease| lease.remaining), Some(10));
//! ```
use std::future::Future;

/// Describes a value which can tell whether it is stale.
pub trait Expirable {
    /// Determines if this value is expired and should be re-fetched.
    fn is_expired(&self) -> bool;
}

/// Invokes the provider and, if it yields an expired value, invokes it exactly once more.
///
/// An absent value is returned as is.
pub fn retry_if_expired<T: Expirable>(provider: impl FnMut() -> Option<T>) -> Option<T> {
    retry_if_expired_with(provider, |_| {})
}

/// Like [retry_if_expired](retry_if_expired) but invokes **on_expired** with the stale value
/// before the second invocation.
pub fn retry_if_expired_with<T: Expirable>(
    mut provider: impl FnMut() -> Option<T>,
    on_expired: impl FnOnce(&T),
) -> Option<T> {
    let value = provider()?;
    if !value.is_expired() {
        return Some(value);
    }

    on_expired(&value);
    provider()
}

/// Provides the async variant of [retry_if_expired_with](retry_if_expired_with).
///
/// The hook is awaited before the provider is invoked the second time.
pub async fn retry_if_expired_async<T, P, PF, E, EF>(mut provider: P, on_expired: E) -> Option<T>
where
    T: Expirable,
    P: FnMut() -> PF,
    PF: Future<Output = Option<T>>,
    E: FnOnce(T) -> EF,
    EF: Future<Output = ()>,
{
    let value = provider().await?;
    if !value.is_expired() {
        return Some(value);
    }

    on_expired(value).await;
    provider().await
}
