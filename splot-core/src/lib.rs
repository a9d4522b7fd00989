//! The splot thing engine
//!
//! A Thing is a composition of named traits, each contributing typed
//! properties partitioned into state, config, and metadata sections,
//! plus optional invokable methods. This crate implements the local
//! engine binding those pieces together: property dispatch and
//! section caching, listener fan out, scenes, timed transitions, the
//! URI resource namespace with lazily bound links, groups, and
//! persistence snapshot/restore.
//!
//! Things are hosted in a [`host::Host`], which assigns each a
//! numeric index addressable through path URIs like `/1/s/onof/v`.
//! All externally observable operations return a deferred result;
//! scheduling goes through an injected [`exec::Executor`].
pub mod dispatch;
pub mod error;
pub mod exec;
pub mod group;
pub mod host;
pub mod key;
pub mod link;
pub mod scene;
pub mod thing;
pub mod traits;
pub mod transition;
pub mod uri;

#[cfg(test)]
mod test;

pub use dispatch::{ArgMap, MethodDef, PropertyDef, StoredTrait, ThingTrait, TraitCallback};
pub use error::{Error, Result};
pub use exec::{default_executor, Exec, Executor, Scheduled, Task, TokioExecutor};
pub use group::Group;
pub use host::{Host, HostConfig, HostConfigBuilder, WeakHost};
pub use key::{MethodKey, Modifier, Mutation, PropFlag, PropertyKey, SectionKind};
pub use link::{LazyResourceLink, LinkCallback, Observation, ResourceLink};
pub use scene::Scene;
pub use thing::{
    ArcThing, ChildCallback, ChildEvent, ListenerHandle, LocalThing, PropertyBatch,
    PropertyCallback, SectionCallback, SectionMap, Snapshot, Thing, ThingBuilder,
};
pub use uri::{Locator, ResourcePath, Target};

// the value model is part of this crate's public surface
pub use splot_value::{CastError, FromValue, Kind, Value};

use futures::future::BoxFuture;

/// Every externally observable operation returns its result in
/// deferred form, even when it completed synchronously.
pub type Deferred<T> = BoxFuture<'static, Result<T>>;

/// Wrap an already computed result in the deferred form.
pub fn deferred<T: Send + 'static>(r: Result<T>) -> Deferred<T> {
    Box::pin(futures::future::ready(r))
}
