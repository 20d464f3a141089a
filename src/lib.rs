#![cfg_attr(docsrs, doc = include_str!("../README.md"))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_debug_implementations)]

#[macro_use]
pub(crate) mod util;
pub(crate) mod loom;

pub mod config;
pub mod cpu;
pub mod cpumask;
pub mod dispatch;
pub mod dsq;
pub mod error;
pub mod fault;
pub mod flags;
pub mod host;
pub mod idle;
pub mod kobj;
pub mod ops;
pub mod rcu;
pub mod runtime;

mod context;

#[doc(inline)]
pub use self::{
    config::Config,
    cpu::CpuId,
    cpumask::{Cpumask, CpumaskRef},
    dispatch::Invocation,
    dsq::{DispatchQueues, DsqId, Locality, QueuedTask},
    error::{BoundsError, ConfigError, KickError, NotFound, QueueError},
    fault::{ErrorReporter, ExitInfo, ExitKind},
    flags::{EnqFlags, KickFlags, WakeFlags},
    host::{DetachedHost, Host},
    idle::{IdleSnapshot, IdleTracker},
    kobj::{Borrowed, CgroupRef, Ref, TaskRef},
    ops::{Ops, Scheduler},
    rcu::ReadSection,
    runtime::{Runtime, Setup, Unloaded},
};
