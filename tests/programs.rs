use acc32::{
    assembler,
    codegen::{self, GenerateError},
    compiler::{self, CompileError, CompilerConfig},
    control::{self, SimulationConfig, SimulationReport, StopReason},
    datapath::TestIo,
    lexer,
    parser,
    symbol_table,
};

use slog::{o, Drain, Logger};
use slog_term::{FullFormat, TermDecorator};

fn run_with(source: &str, input: Vec<i32>, config: &SimulationConfig) -> SimulationReport {
    let lines = compiler::compile(source)
        .unwrap_or_else(|err| panic!("could not compile the program: {}", err));

    assert!(lines.iter().all(|line| !line.contains('%')), "unresolved placeholder in {:?}", lines);

    let memory = assembler::load(&lines[..], None)
        .expect("could not load the assembly");

    control::simulate(memory, TestIo::with_input(input), config, None)
        .expect("the machine stopped with an error")
}

fn run(source: &str) -> SimulationReport {
    run_with(source, Vec::new(), &SimulationConfig::default())
}

#[test]
fn test_sum_of_globals() {
    let report = run("int32 a = 2\nint32 b = 3\nOUT(a + b)");

    assert_eq!(report.output, vec![5]);
    assert_eq!(report.stop, StopReason::Halted);
    assert!(report.ticks > report.instructions as u64);
}

#[test]
fn test_function_call() {
    let report = run("int32 f(int32 x) { return x + x }\nOUT(f(4))");

    assert_eq!(report.output, vec![8]);
}

#[test]
fn test_semicolon_separated_function() {
    let report = run("int32 f(int32 x){int32 y=x*2; return y;}\nOUT(f(21));");

    assert_eq!(report.output, vec![42]);
}

#[test]
fn test_for_body_runs_before_first_test() {
    let report = run("for (int32 i = 5; i < 3; i = i + 1) { OUT(i) }");

    assert_eq!(report.output, vec![5]);
}

#[test]
fn test_for_loop() {
    let report = run("for (int32 i = 0; i < 3; i = i + 1) { OUT(i) }");

    assert_eq!(report.output, vec![0, 1, 2]);
    assert_eq!(report.stop, StopReason::Halted);
}

#[test]
fn test_branching() {
    let report = run(r#"
        int32 n = 0
        do { n = n + 1 } while (n < 5)
        while (n > 2) n = n - 1
        if (n == 2) { OUT(65) }
        if (n != 2) { OUT(66) }
    "#);

    assert_eq!(report.output, b"A".to_vec());
}

#[test]
fn test_local_shadows_global() {
    let report = run("int32 x = 1\nvoid f() {\n int32 x = 7\n OUT(x)\n}\nf()\nOUT(x)");

    assert_eq!(report.output, vec![7, 1]);
}

#[test]
fn test_shadowing_at_every_depth() {
    let report = run(r#"
        int32 x = 1
        void f() {
            int32 x = 2
            if (1) {
                int32 x = 3
                if (1) {
                    int32 x = 4
                    OUT(x)
                }
                OUT(x)
            }
            OUT(x)
        }
        f()
        if (1) {
            int32 x = 5
            OUT(x)
        }
        OUT(x)
    "#);

    assert_eq!(report.output, vec![4, 3, 2, 5, 1]);
}

#[test]
fn test_sub_word_locals_are_narrowed() {
    let report = run("void f() {\n int8 c = 300\n int16 h = 70000\n OUT(c + 1)\n OUT(h - 4400)\n}\nf()");

    // 300 wraps to 44 as a byte and 70000 to 4464 as a half word.
    assert_eq!(report.output, vec![45, 64]);
}

#[test]
fn test_operators_and_ties() {
    let cases: &[(&str, u8)] = &[
        ("10 - 3 + 2", 9),
        ("20 - 5 - 3", 12),
        ("7 % 4 * 3", 9),
        ("2 + 3 * 4", 14),
        ("(0 - 7) % 3", 2),
        ("1 + 1 << 2", 8),
        ("1 << 4 >> 2", 4),
        ("3 < 5", 255),
        ("5 < 3", 0),
        ("5 > 3", 255),
        ("4 == 4", 255),
        ("4 != 4", 0),
        ("1 << 2 == 4", 255),
        ("3 < 5 && 2 > 7", 0),
        ("1 > 2 || 2 > 1", 255),
        ("12 && 10", 8),
        ("12 || 3", 15),
    ];

    let source = cases.iter()
        .map(|(formula, _)| format!("OUT({})", formula))
        .collect::<Vec<_>>()
        .join("\n");

    let report = run(&source);
    let expected = cases.iter().map(|(_, value)| *value).collect::<Vec<_>>();

    assert_eq!(report.output, expected);
}

#[test]
fn test_every_function_is_stack_balanced() {
    let source = r#"
        int32 g = 3
        int32 twice(int32 v) { return v + v }
        int32 pick(int32 a, int32 b) {
            int32 t = a
            if (b > a) { int32 u = b; t = u }
            return t
        }
        void show(int32 v) {
            int16 parts[2]
            parts[0] = v
            for (int32 i = 0; i < 2; i = i + 1) { OUT(parts[0] + i) }
        }
        do { g = g - 1 } while (g > 0)
        show(pick(twice(2), 3))
    "#;

    let tokens = lexer::tokenize(source, None).unwrap();
    let program = parser::parse(tokens, None).unwrap();
    let (table, errors) = symbol_table::resolve(&program, None);
    assert!(errors.is_empty());

    let module = codegen::generate(&table, None).unwrap();
    assert_eq!(module.functions.len(), 4);

    for function in &module.functions {
        let net: isize = function.body.iter().map(|instruction| instruction.stack_effect()).sum();
        assert_eq!(net, 0, "{} is not balanced", function.key);
    }

    assert_eq!(run(source).output, vec![4, 5]);
}

#[test]
fn test_string_indexing() {
    let report = run(r#"
        str s = "hey"
        int32 i = 0
        while (i < 3) {
            OUT(s[i])
            i = i + 1
        }
    "#);

    assert_eq!(report.output, b"hey".to_vec());
}

#[test]
fn test_int16_array() {
    let report = run("int16 a[4]\na[1] = 300\na[2] = a[1] + 5\nOUT(a[2] - 300)\nOUT(a[0])");

    assert_eq!(report.output, vec![5, 0]);
}

#[test]
fn test_recursive_factorial() {
    let report = run(r#"
        int32 fact(int32 n) {
            if (n < 2) { return 1 }
            return n * fact(n - 1)
        }
        OUT(fact(5))
    "#);

    assert_eq!(report.output, vec![120]);
    assert_eq!(report.stop, StopReason::Halted);
}

#[test]
fn test_echo_until_input_runs_out() {
    let source = "int32 c = IN()\nwhile (1) {\n OUT(c)\n c = IN()\n}";
    let report = run_with(source, vec![104, 105], &SimulationConfig::default());

    assert_eq!(report.output, b"hi".to_vec());
    assert_eq!(report.stop, StopReason::InputExhausted);
}

#[test]
fn test_instruction_limit() {
    let config = SimulationConfig { instruction_limit: 100 };
    let report = run_with("int32 i = 0\nwhile (1) { i = i + 1 }", Vec::new(), &config);

    assert_eq!(report.stop, StopReason::InstructionLimit);
    assert_eq!(report.instructions, 100);
    assert!(report.output.is_empty());
}

#[test]
fn test_computed_array_size_is_rejected() {
    for source in &["int32 a[1 - 1]\nOUT(1)", "int8 b[2 - 3]\nOUT(1)"] {
        match compiler::compile(source) {
            Err(CompileError::Generate(errors)) => assert!(match errors.as_slice() {
                [GenerateError::NonPositiveArraySize { size, .. }] => *size <= 0,
                _ => false,
            }),
            other => panic!("unexpected result {:?}", other),
        }
    }
}

#[test]
fn test_compile_errors_are_collected() {
    let err = compiler::compile("void v = 1\nint8 a[0]\nOUT(missing)").unwrap_err();

    match err {
        CompileError::Generate(errors) => {
            assert_eq!(errors.len(), 3);
            assert!(errors.iter().any(|e| match e {
                GenerateError::VoidVariable { name, .. } => name == "v",
                _ => false,
            }));
            assert!(errors.iter().any(|e| match e {
                GenerateError::NonPositiveArraySize { size: 0, .. } => true,
                _ => false,
            }));
            assert!(errors.iter().any(|e| match e {
                GenerateError::Undeclared { name, .. } => name == "missing",
                _ => false,
            }));
        },
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_logged_pipeline() {
    let decorator = TermDecorator::new().build();
    let drain = FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let logger = Logger::root(drain, o!());

    let config = CompilerConfig { stack_size: 32 };
    let lines = compiler::compile_with_config("OUT(72)\nOUT(105)", &config, logger.clone()).unwrap();
    assert_eq!(lines[0], "JMP 33");

    let memory = assembler::load(&lines[..], logger.clone()).unwrap();
    let report = control::simulate(memory, TestIo::new(), &SimulationConfig::default(), logger).unwrap();

    assert_eq!(report.output, b"Hi".to_vec());
}
