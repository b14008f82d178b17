//! Analyzer contract enforcement and type lowering

use udo_runtime::{DbType, UdoError, UdoHandle};

fn demo_with_methods(methods: &str) -> String {
    format!(
        r#"
        #include <udo/UDOperator.hpp>

        class Demo : public udo::UDOperator {{
           int32_t stored = 0;

           public:
           struct InputTuple {{
              int32_t x;
           }};
           struct OutputTuple {{
              int32_t y;
           }};

           {}
        }};
        "#,
        methods
    )
}

const VALID_METHODS: &str = r#"
    void accept(udo::ExecutionState state, const InputTuple& input) {
       stored = input.x;
    }

    bool process(udo::ExecutionState state) {
       emit<Demo>(state, OutputTuple{stored});
       return true;
    }
"#;

fn analyze(source: &str, class_name: &str) -> Result<UdoHandle, UdoError> {
    let mut handle = UdoHandle::new(source, class_name);
    handle.analyze().map(|()| handle)
}

#[test]
fn the_demo_operator_analyzes() {
    let handle = analyze(&demo_with_methods(VALID_METHODS), "Demo").unwrap();
    let analysis = handle.analysis_ref().unwrap();
    assert_eq!(analysis.name, "Demo");
    assert_eq!(analysis.size, 4);
    assert_eq!(analysis.alignment, 4);
    assert!(analysis.accept.is_some());
    assert!(analysis.process.is_some());
    assert!(analysis.extra_work.is_none());
    assert!(analysis.emit_in_process);
    assert!(!analysis.emit_in_accept);
}

#[test]
fn missing_class_is_rejected() {
    let err = analyze(&demo_with_methods(VALID_METHODS), "Missing").unwrap_err();
    assert!(err.message().contains("Missing"));
}

#[test]
fn polymorphic_classes_are_rejected() {
    let methods = r#"
        virtual void helper(udo::ExecutionState state) {}

        void accept(udo::ExecutionState state, const InputTuple& input) {}

        bool process(udo::ExecutionState state) {
           emit<Demo>(state, OutputTuple{0});
           return true;
        }
    "#;
    let err = analyze(&demo_with_methods(methods), "Demo").unwrap_err();
    assert_eq!(err.message(), "UDO class must not be polymorphic");
}

#[test]
fn the_operator_base_must_be_public_and_non_virtual() {
    let source = r#"
        #include <udo/UDOperator.hpp>
        class Demo {
           public:
           struct InputTuple { int32_t x; };
           struct OutputTuple { int32_t y; };
           bool process(udo::ExecutionState state) {
              emit<Demo>(state, OutputTuple{0});
              return true;
           }
        };
    "#;
    let err = analyze(source, "Demo").unwrap_err();
    assert_eq!(
        err.message(),
        "UDOperator must be a public, unambiguous, non-virtual base"
    );

    let source = source.replace("class Demo {", "class Demo : private udo::UDOperator {");
    let err = analyze(&source, "Demo").unwrap_err();
    assert_eq!(
        err.message(),
        "UDOperator must be a public, unambiguous, non-virtual base"
    );
}

#[test]
fn the_tuple_types_must_exist() {
    let source = r#"
        #include <udo/UDOperator.hpp>
        class Demo : public udo::UDOperator {
           public:
           struct OutputTuple { int32_t y; };
           bool process(udo::ExecutionState state) {
              emit<Demo>(state, OutputTuple{0});
              return true;
           }
        };
    "#;
    let err = analyze(source, "Demo").unwrap_err();
    assert!(err.message().contains("InputTuple"));
}

#[test]
fn udos_must_instantiate_emit_for_their_class() {
    let methods = r#"
        void accept(udo::ExecutionState state, const InputTuple& input) {
           stored = input.x;
        }

        bool process(udo::ExecutionState state) {
           return false;
        }
    "#;
    let err = analyze(&demo_with_methods(methods), "Demo").unwrap_err();
    assert_eq!(
        err.message(),
        "UDO does not call emit() or does not use its class type as template argument"
    );
}

// === Signature contracts (every mutation must name the expected form) ===

#[test]
fn accept_signature_mutations_are_rejected() {
    let mutations = [
        // wrong tuple parameter type
        "void accept(udo::ExecutionState state, int32_t input) {}",
        // by-value tuple instead of const reference
        "void accept(udo::ExecutionState state, InputTuple input) {}",
        // wrong return type
        "int32_t accept(udo::ExecutionState state, const InputTuple& input) { return 0; }",
        // static where an instance method is required
        "static void accept(udo::ExecutionState state, const InputTuple& input) {}",
        // missing execution state
        "void accept(const InputTuple& input) {}",
    ];
    for mutation in mutations {
        let methods = format!(
            r#"
            {}

            bool process(udo::ExecutionState state) {{
               emit<Demo>(state, OutputTuple{{0}});
               return true;
            }}
            "#,
            mutation
        );
        let err = analyze(&demo_with_methods(&methods), "Demo").unwrap_err();
        assert_eq!(
            err.message(),
            "invalid signature of accept function, expected signature: \
             void accept(udo::ExecutionState, const InputTuple&)",
            "mutation not rejected: {}",
            mutation
        );
    }
}

#[test]
fn extra_work_signature_mutations_are_rejected() {
    let mutations = [
        "void extraWork(udo::ExecutionState state, uint32_t step) {}",
        "uint32_t extraWork(udo::ExecutionState state, int32_t step) { return 0; }",
        "static uint32_t extraWork(udo::ExecutionState state, uint32_t step) { return 0; }",
        "uint32_t extraWork(uint32_t step) { return 0; }",
    ];
    for mutation in mutations {
        let methods = format!(
            r#"
            {}

            bool process(udo::ExecutionState state) {{
               emit<Demo>(state, OutputTuple{{0}});
               return true;
            }}
            "#,
            mutation
        );
        let err = analyze(&demo_with_methods(&methods), "Demo").unwrap_err();
        assert_eq!(
            err.message(),
            "invalid signature of extraWork function, expected signature: \
             uint32_t extraWork(udo::ExecutionState, uint32_t)",
            "mutation not rejected: {}",
            mutation
        );
    }
}

#[test]
fn process_signature_mutations_are_rejected() {
    let mutations = [
        "void process(udo::ExecutionState state) { emit<Demo>(state, OutputTuple{0}); }",
        "bool process(udo::ExecutionState state, uint32_t extra) { return true; }",
        "static bool process(udo::ExecutionState state) { return true; }",
    ];
    for mutation in mutations {
        let err = analyze(&demo_with_methods(mutation), "Demo").unwrap_err();
        assert_eq!(
            err.message(),
            "invalid signature of process function, expected signature: \
             bool process(udo::ExecutionState)",
            "mutation not rejected: {}",
            mutation
        );
    }
}

// === Constructors ===

#[test]
fn multiple_constructors_are_rejected() {
    let methods = r#"
        Demo(int32_t start) : stored(start) {}
        Demo(int32_t start, int32_t unused) : stored(start) {}

        bool process(udo::ExecutionState state) {
           emit<Demo>(state, OutputTuple{stored});
           return true;
        }
    "#;
    let err = analyze(&demo_with_methods(methods), "Demo").unwrap_err();
    assert!(err.message().contains("Multiple constructors"));
}

#[test]
fn copy_and_move_constructors_are_ignored() {
    let methods = r#"
        Demo(int32_t start) : stored(start) {}
        Demo(const Demo& other) : stored(other.stored) {}
        Demo(Demo&& other) : stored(other.stored) {}

        bool process(udo::ExecutionState state) {
           emit<Demo>(state, OutputTuple{stored});
           return true;
        }
    "#;
    let handle = analyze(&demo_with_methods(methods), "Demo").unwrap();
    let analysis = handle.analysis_ref().unwrap();
    assert!(analysis.constructor.is_some());
    assert_eq!(analysis.constructor_args.len(), 1);
}

#[test]
fn constructor_arguments_lower_to_db_types() {
    let methods = r#"
        Demo(int32_t a, double b) : stored(a) {}

        bool process(udo::ExecutionState state) {
           emit<Demo>(state, OutputTuple{stored});
           return true;
        }
    "#;
    let mut handle = analyze(&demo_with_methods(methods), "Demo").unwrap();
    let args = handle.arguments().unwrap();
    assert_eq!(args.scalar.as_slice(), &[DbType::Int4, DbType::Float8]);
    assert!(!args.has_table_arg);
}

// === Type lowering (the fixed IR-to-database table) ===

#[test]
fn all_supported_types_round_trip() {
    let source = r#"
        #include <udo/UDOperator.hpp>

        class Wide : public udo::UDOperator {
           public:
           struct InputTuple {};
           struct OutputTuple {
              bool flag;
              int16_t small;
              int32_t normal;
              int64_t large;
              float approx;
              double precise;
              udo::String text;
           };

           bool process(udo::ExecutionState state) {
              emit<Wide>(state, OutputTuple{true, 1, 2, 3, 4.0f, 5.0});
              return false;
           }
        };
    "#;
    let mut handle = UdoHandle::new(source, "Wide");
    handle.analyze().unwrap();

    let attrs = handle.output_attributes().unwrap();
    let expected = [
        ("flag", 1, 1, DbType::Bool),
        ("small", 2, 2, DbType::Int2),
        ("normal", 4, 4, DbType::Int4),
        ("large", 8, 8, DbType::Int8),
        ("approx", 4, 4, DbType::Float4),
        ("precise", 8, 8, DbType::Float8),
        ("text", 16, 8, DbType::Text),
    ];
    assert_eq!(attrs.len(), expected.len());
    for (attr, (name, size, align, db_type)) in attrs.iter().zip(expected) {
        assert_eq!(attr.name, name);
        assert_eq!(attr.size, size);
        assert_eq!(attr.alignment, align);
        assert_eq!(attr.db_type, db_type);
    }
}

#[test]
fn unsupported_attribute_types_fail_at_lowering() {
    // Analysis itself succeeds; the rejection happens when the catalog asks
    // for the attribute types
    let source = r#"
        #include <udo/UDOperator.hpp>

        class Odd : public udo::UDOperator {
           public:
           struct InputTuple {};
           struct OutputTuple {
              long double z;
           };

           bool process(udo::ExecutionState state) {
              return false;
           }
           void helper(udo::ExecutionState state) {
              emit<Odd>(state, OutputTuple{});
           }
        };
    "#;
    let mut handle = UdoHandle::new(source, "Odd");
    handle.analyze().unwrap();
    let err = handle.output_attributes().unwrap_err();
    assert_eq!(err.message(), "Unsupported type in C++ UDO in attribute z");
    assert_eq!(
        handle.last_error_message(),
        "Unsupported type in C++ UDO in attribute z"
    );
}

#[test]
fn input_attributes_follow_the_accept_method() {
    let handle_without_accept = {
        let source = r#"
            #include <udo/UDOperator.hpp>
            class Gen : public udo::UDOperator {
               public:
               struct InputTuple { int64_t unused; };
               struct OutputTuple { int64_t v; };
               bool process(udo::ExecutionState state) {
                  emit<Gen>(state, OutputTuple{1});
                  return false;
               }
            };
        "#;
        let mut handle = UdoHandle::new(source, "Gen");
        handle.analyze().unwrap();
        handle
    };
    let mut handle = handle_without_accept;
    assert!(handle.input_attributes().unwrap().is_empty());
    assert!(!handle.arguments().unwrap().has_table_arg);

    let mut handle = UdoHandle::new(demo_with_methods(VALID_METHODS), "Demo");
    handle.analyze().unwrap();
    let input = handle.input_attributes().unwrap();
    assert_eq!(input.len(), 1);
    assert_eq!(input[0].name, "x");
    assert_eq!(input[0].db_type, DbType::Int4);
}
