//! The runtime header distributed to UDO authors
//!
//! The analyzer injects this before the user source, the same way the
//! original toolchain mounts it as a virtual include. The declarations here
//! define the operator contract: the base class, the execution-state record,
//! the string type, and the two runtime callbacks.

pub const RUNTIME_HEADER: &str = r#"
namespace udo {

struct String {
   const char* data;
   uint64_t size;
};

struct ExecutionState {
   void* localState;
   void* threadState;

   void* getLocalState();
   uint32_t getThreadId();
};

void printDebug(const char* msg, uint64_t size);
uint64_t getRandom();

struct UDOperator {
   template <typename T>
   static void emit(ExecutionState state, const typename T::OutputTuple& tuple);
};

}
"#;
