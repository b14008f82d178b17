//! # UDO Runtime
//!
//! The runtime core of a database engine extension that compiles, links,
//! and executes user-defined operators (UDOs) inside the query-execution
//! process. A host submits source text and the qualified name of a class
//! implementing an operator; the runtime analyzes the source against the
//! operator contract, lowers it to an object image via Cranelift, resolves
//! and relocates it against a private copy of the C runtime, places the
//! image in a dedicated memory region with the right page permissions, and
//! returns callable entry points plus catalog metadata.
//!
//! ## Pipeline
//!
//! ```text
//! source -> analyzer -> IR -> preprocess -> codegen -> linker -> execution
//! ```
//!
//! 1. **Analyzer** - parse the source, find the operator class, enforce the
//!    lifecycle signature contracts, record the schemas
//! 2. **Preprocess** - install callback trampolines, the libc bootstrap,
//!    and stable export names on the IR module
//! 3. **Codegen** - emit a relocatable x86-64 object through Cranelift
//! 4. **Linker** - resolve the object against static archives and
//!    predefined symbols, place it into one 2 GiB region, apply relocations
//! 5. **Execution** - freeze and snapshot memory, initialize per-run state,
//!    hand out typed entry points
//!
//! ## Quick start
//!
//! ```no_run
//! use udo_runtime::{AllocationFns, UdoHandle};
//!
//! let source = std::fs::read_to_string("operator.cpp").unwrap();
//! let mut handle = UdoHandle::new(source, "MyOperator");
//! handle.analyze().unwrap();
//! let output = handle.output_attributes().unwrap();
//! handle.compile().unwrap();
//! handle.link(AllocationFns::process_allocator(), -65536, 65536).unwrap();
//! let entry_points = handle.execution().unwrap().initialize().unwrap();
//! # let _ = (output, entry_points);
//! ```

pub mod analyzer;
pub mod auxv;
pub mod codegen;
pub mod error;
pub mod execution;
pub mod frontend;
pub mod handle;
pub mod ir;
pub mod linker;
mod lower;
pub mod memory;
pub mod preprocess;
mod runtime_header;
pub mod settings;
pub mod tls;

pub use analyzer::{DbAttribute, DbType, UdoAnalysis, UdoAnalyzer};
pub use error::{UdoError, UdoResult};
pub use execution::{
    AllocationFns, EmitCallback, GetRandomCallback, PrintDebugCallback, UdoExecution, UdoFunctions,
    UdoFunctor, UdoFunctors,
};
pub use handle::{UdoArguments, UdoCache, UdoHandle};
pub use memory::{AllocationKind, MemoryManager};
pub use tls::DynamicTls;
