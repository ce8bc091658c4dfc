// ABOUTME: Execution unit handles, allocator, and provider backends for isolated execution
// ABOUTME: Exposes the provider trait plus local and Docker implementations

pub mod allocator;
pub mod providers;
pub mod unit;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use allocator::{BatchAcquisition, UnitAllocator};
pub use providers::{
    CommandSpec, DockerProvider, ExecResult, LocalProvider, Provider, ProviderCapabilities,
    ProviderError, ProviderInfo, ProviderStatus, UnitConfig,
};
pub use unit::{ExecutionUnit, UnitError, UnitState};
