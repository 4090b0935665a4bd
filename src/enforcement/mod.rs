//! Site, application and activity enforcement.

pub mod activity;
pub mod enforcer;
pub mod filter;
pub mod intercept;
pub mod packet;
pub mod process;
pub mod resolver;

pub use activity::{ActivityMonitor, CoreProcesses, ProcessSnapshot};
pub use enforcer::{EnforcementReport, ProcessEnforcer, enforce_once};
pub use filter::{FilterControl, FilterSettings, FilterState, PacketFilterEngine};
pub use intercept::{InterceptHandle, Interceptor, PlatformInterceptor, Received};
pub use process::{ProcessInfo, ProcessTable, SystemProcessTable, TerminateError};
pub use resolver::{BlockTable, DomainResolver, Resolver, SystemResolver};
