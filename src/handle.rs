//! The UDO handle the host drives
//!
//! One handle owns one UDO through its strict lifecycle: create, analyze,
//! compile, link, then initialize-and-run through the execution handle.
//! Every transition is one-shot; only initialization is revisited between
//! runs. The handle stores the last error message for the host's
//! diagnostics query.

use std::ffi::c_void;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::analyzer::types::{lower_db_type, DbAttribute, DbType};
use crate::analyzer::{UdoAnalysis, UdoAnalyzer};
use crate::codegen;
use crate::error::{UdoError, UdoResult};
use crate::execution::{default_archives, AllocationFns, UdoExecution};
use crate::preprocess;
use crate::settings::Setting;

static PRINT_CXX_UDO_WARNINGS: Setting<bool> = Setting::new(
    "printCxxUDOWarnings",
    "Print warnings of C++ UDO compilation",
    false,
);

/// Lifecycle phase of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Created,
    Analyzed,
    Compiled,
    Linked,
}

/// The scalar arguments and table-argument flag of a UDO
#[derive(Debug, Clone)]
pub struct UdoArguments {
    /// Database types of the constructor's scalar arguments
    pub scalar: SmallVec<[DbType; 4]>,
    /// Does the operator consume an input table?
    pub has_table_arg: bool,
}

/// A handle owning one UDO through analysis, compilation, and execution
pub struct UdoHandle {
    source: String,
    class_name: String,
    phase: Phase,
    analysis: Option<UdoAnalysis>,
    object: Option<Vec<u8>>,
    execution: Option<UdoExecution>,
    last_error: String,
}

impl std::fmt::Debug for UdoHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdoHandle")
            .field("class_name", &self.class_name)
            .field("phase", &self.phase)
            .field("last_error", &self.last_error)
            .finish()
    }
}

impl UdoHandle {
    /// Create a handle for the given source and qualified class name
    pub fn new(source: impl Into<String>, class_name: impl Into<String>) -> Self {
        UdoHandle {
            source: source.into(),
            class_name: class_name.into(),
            phase: Phase::Created,
            analysis: None,
            object: None,
            execution: None,
            last_error: String::new(),
        }
    }

    /// The message of the most recent failure
    pub fn last_error_message(&self) -> &str {
        &self.last_error
    }

    fn record<T>(&mut self, result: UdoResult<T>) -> UdoResult<T> {
        if let Err(err) = &result {
            self.last_error = err.message().to_string();
        }
        result
    }

    fn require_phase(&self, expected: Phase, operation: &str) -> UdoResult<()> {
        if self.phase != expected {
            return Err(UdoError::invalid_user_code(format!(
                "{} called out of order",
                operation
            )));
        }
        Ok(())
    }

    fn analysis(&self) -> UdoResult<&UdoAnalysis> {
        self.analysis
            .as_ref()
            .ok_or_else(|| UdoError::invalid_user_code("UDO is not analyzed"))
    }

    // === Pipeline ===

    /// Analyze the source against the operator contract
    pub fn analyze(&mut self) -> UdoResult<()> {
        let result = (|| {
            self.require_phase(Phase::Created, "analyze")?;
            let analysis = UdoAnalyzer::new(&self.source, &self.class_name).analyze()?;
            if PRINT_CXX_UDO_WARNINGS.get_bool() && !analysis.warnings.is_empty() {
                eprintln!("== udo compilation warnings: ==");
                for warning in &analysis.warnings {
                    eprintln!("{}", warning);
                }
            }
            self.analysis = Some(analysis);
            self.phase = Phase::Analyzed;
            Ok(())
        })();
        self.record(result)
    }

    /// Preprocess the module and emit the object image
    pub fn compile(&mut self) -> UdoResult<()> {
        let result = (|| {
            self.require_phase(Phase::Analyzed, "compile")?;
            let analysis = self
                .analysis
                .as_mut()
                .ok_or_else(|| UdoError::invalid_user_code("UDO is not analyzed"))?;
            preprocess::preprocess_module(analysis)?;
            let object = codegen::compile(&analysis.module)?;
            self.object = Some(object);
            self.phase = Phase::Compiled;
            Ok(())
        })();
        self.record(result)
    }

    /// Link the compiled object against the default archive set
    pub fn link(
        &mut self,
        allocation_fns: AllocationFns,
        tls_block_offset: i64,
        tls_block_size: u64,
    ) -> UdoResult<()> {
        let archives = default_archives();
        self.link_with_archives(allocation_fns, tls_block_offset, tls_block_size, &archives)
    }

    /// Link against an explicit archive set
    pub fn link_with_archives(
        &mut self,
        allocation_fns: AllocationFns,
        tls_block_offset: i64,
        tls_block_size: u64,
        archives: &[String],
    ) -> UdoResult<()> {
        let result = (|| {
            self.require_phase(Phase::Compiled, "link")?;
            let object = self
                .object
                .as_ref()
                .ok_or_else(|| UdoError::compile("UDO is not compiled"))?
                .clone();
            let mut execution = UdoExecution::new(object);
            execution.link(allocation_fns, tls_block_offset, tls_block_size, archives)?;
            self.execution = Some(execution);
            self.phase = Phase::Linked;
            Ok(())
        })();
        self.record(result)
    }

    /// The execution handle, available after a successful link
    pub fn execution(&mut self) -> Option<&mut UdoExecution> {
        self.execution.as_mut()
    }

    /// The libc bootstrap argument; valid until the handle is destroyed
    pub fn constructor_arg(&mut self) -> UdoResult<*mut c_void> {
        let execution = self
            .execution
            .as_mut()
            .ok_or_else(|| UdoError::link("UDO is not linked"))?;
        Ok(execution.libc_start_argument())
    }

    // === Catalog queries ===

    /// Scalar constructor arguments and the table-argument flag
    pub fn arguments(&mut self) -> UdoResult<UdoArguments> {
        let result = (|| {
            let analysis = self.analysis()?;
            let mut scalar = SmallVec::new();
            for (index, ty) in analysis.constructor_args.iter().enumerate() {
                let attr = lower_db_type(
                    &analysis.types,
                    ty,
                    analysis.string_record,
                    &format!("argument {}", index),
                )?;
                scalar.push(attr.db_type);
            }
            Ok(UdoArguments {
                scalar,
                has_table_arg: analysis.accept.is_some(),
            })
        })();
        self.record(result)
    }

    /// The output schema with database types, sizes, and alignments
    pub fn output_attributes(&mut self) -> UdoResult<Vec<DbAttribute>> {
        let result = (|| {
            let analysis = self.analysis()?;
            analysis
                .output
                .iter()
                .map(|attr| {
                    lower_db_type(&analysis.types, &attr.ty, analysis.string_record, &attr.name)
                })
                .collect()
        })();
        self.record(result)
    }

    /// The input tuple layout, empty when the operator takes no input
    pub fn input_attributes(&mut self) -> UdoResult<Vec<DbAttribute>> {
        let result = (|| {
            let analysis = self.analysis()?;
            if analysis.accept.is_none() {
                return Ok(Vec::new());
            }
            analysis
                .input
                .iter()
                .map(|attr| {
                    lower_db_type(&analysis.types, &attr.ty, analysis.string_record, &attr.name)
                })
                .collect()
        })();
        self.record(result)
    }

    /// Size of the operator object in bytes
    pub fn instance_size(&self) -> UdoResult<u64> {
        Ok(self.analysis()?.size)
    }

    /// Alignment of the operator object
    pub fn instance_alignment(&self) -> UdoResult<u64> {
        Ok(self.analysis()?.alignment)
    }

    /// The analysis, for hosts that need the full schema information
    pub fn analysis_ref(&self) -> Option<&UdoAnalysis> {
        self.analysis.as_ref()
    }
}

/// A host-owned cache of prepared handles keyed by the host's hash of the
/// source and class name
#[derive(Default)]
pub struct UdoCache {
    entries: FxHashMap<u64, UdoHandle>,
}

impl UdoCache {
    pub fn new() -> Self {
        UdoCache::default()
    }

    /// Store a prepared handle under the given key
    pub fn put(&mut self, key: u64, handle: UdoHandle) {
        self.entries.insert(key, handle);
    }

    /// Take the handle stored under the key, transferring ownership back to
    /// the caller
    pub fn get(&mut self, key: u64) -> Option<UdoHandle> {
        self.entries.remove(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEMO_SOURCE: &str = r#"
        #include <udo/UDOperator.hpp>

        class Demo : public udo::UDOperator {
           int32_t stored = 0;

           public:
           struct InputTuple {
              int32_t x;
           };
           struct OutputTuple {
              int32_t y;
           };

           void accept(udo::ExecutionState state, const InputTuple& input) {
              stored = input.x;
           }

           bool process(udo::ExecutionState state) {
              emit<Demo>(state, OutputTuple{stored});
              return true;
           }
        };
    "#;

    #[test]
    fn operations_require_the_right_phase() {
        let mut handle = UdoHandle::new(DEMO_SOURCE, "Demo");
        assert!(handle.compile().is_err());
        handle.analyze().unwrap();
        assert!(handle.analyze().is_err());
        assert!(!handle.last_error_message().is_empty());
    }

    #[test]
    fn arguments_reflect_the_demo_operator() {
        let mut handle = UdoHandle::new(DEMO_SOURCE, "Demo");
        handle.analyze().unwrap();
        let args = handle.arguments().unwrap();
        assert!(args.scalar.is_empty());
        assert!(args.has_table_arg);

        let output = handle.output_attributes().unwrap();
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].name, "y");
        assert_eq!(output[0].size, 4);
        assert_eq!(output[0].alignment, 4);
        assert_eq!(output[0].db_type, DbType::Int4);
    }

    #[test]
    fn cache_round_trips_handles() {
        let mut cache = UdoCache::new();
        let mut handle = UdoHandle::new(DEMO_SOURCE, "Demo");
        handle.analyze().unwrap();
        cache.put(42, handle);
        assert!(cache.get(7).is_none());
        let handle = cache.get(42).unwrap();
        assert!(handle.analysis_ref().is_some());
        assert!(cache.get(42).is_none());
    }
}
