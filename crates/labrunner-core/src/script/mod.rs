//! The embedded scripting language executed by workers.
//!
//! Code units are small indentation-structured programs. A unit runs against
//! two namespaces: the global namespace shared by every worker of a runner and
//! the local namespace owned by its identifier.
//!
//! ```text
//! source ──tokenize──▶ tokens ──parse──▶ Program ──Interpreter──▶ effects
//!                                                    │
//!                                   globals / locals ┘
//! ```

mod ast;
mod builtins;
mod exception;
mod interp;
mod lexer;
mod parser;
mod value;

pub use ast::Program;
pub use builtins::{Builtin, EXCEPTION_KINDS};
pub use exception::{Exception, ExceptionInfo, ScriptError, TraceFrame};
pub use interp::{Interpreter, MAX_DEPTH};
pub use lexer::SyntaxError;
pub use parser::parse;
pub use value::{Function, Value};

use crate::execute::{AbortHandle, ScriptIo};
use crate::namespace::Namespace;

/// Parse and execute one code unit.
///
/// Syntax errors are reported as a raised `SyntaxError` so that callers see a
/// single failure shape.
pub fn run(
    code: &str,
    filename: &str,
    globals: &Namespace,
    locals: &Namespace,
    io: &dyn ScriptIo,
    abort: &AbortHandle,
) -> Result<(), ScriptError> {
    let program = parse(code, filename).map_err(|e| syntax_exception(&e, filename))?;
    Interpreter::new(globals.clone(), io, abort).run_program(&program, locals)
}

/// Wrap a parse failure as a raised exception.
pub fn syntax_exception(error: &SyntaxError, filename: &str) -> Exception {
    Exception::new(
        ExceptionInfo::new("SyntaxError", error.message.clone()),
        vec![TraceFrame {
            filename: filename.to_string(),
            line: error.line,
            function: "<script>".to_string(),
        }],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::BufferedIo;
    use std::thread;
    use std::time::Duration;

    fn exec(code: &str) -> (Result<(), ScriptError>, Namespace, BufferedIo) {
        let globals = Namespace::new();
        let locals = Namespace::new();
        locals.set("globals", Value::Namespace(globals.clone()));
        let io = BufferedIo::new();
        let abort = AbortHandle::new();
        let result = run(code, "test.txt", &globals, &locals, &io, &abort);
        (result, locals, io)
    }

    fn raised(code: &str) -> Exception {
        match exec(code).0 {
            Err(ScriptError::Raised(exc)) => exc,
            other => panic!("expected an exception, got {:?}", other),
        }
    }

    #[test]
    fn test_assignment_and_arithmetic() {
        let (result, locals, _) = exec("x = 1 + 1\ny = 7 // 2\nz = -7 % 3\nw = 2 ** 10\n");
        assert!(result.is_ok());
        assert!(matches!(locals.get("x"), Some(Value::Int(2))));
        assert!(matches!(locals.get("y"), Some(Value::Int(3))));
        assert!(matches!(locals.get("z"), Some(Value::Int(2))));
        assert!(matches!(locals.get("w"), Some(Value::Int(1024))));
    }

    #[test]
    fn test_print_goes_to_io() {
        let (result, _, io) = exec("print('a', 1, [1, 'b'])\neprint('oops')\n");
        assert!(result.is_ok());
        assert_eq!(io.take_stdout(), "a 1 [1, 'b']\n");
        assert_eq!(io.take_stderr(), "oops\n");
    }

    #[test]
    fn test_functions_loops_and_recursion() {
        let code = "\
def fib(n):
    if n < 2:
        return n
    return fib(n - 1) + fib(n - 2)

total = 0
for i in range(10):
    if i % 2 == 0:
        continue
    total += i
result = fib(15)
";
        let (result, locals, _) = exec(code);
        assert!(result.is_ok(), "{:?}", result);
        assert!(matches!(locals.get("total"), Some(Value::Int(25))));
        assert!(matches!(locals.get("result"), Some(Value::Int(610))));
    }

    #[test]
    fn test_globals_handle() {
        let code = "globals.count = 3\nglobals['count'] += 1\nprint(globals.count)\n";
        let (result, _, io) = exec(code);
        assert!(result.is_ok());
        assert_eq!(io.take_stdout(), "4\n");
    }

    #[test]
    fn test_raise_captures_traceback() {
        let exc = raised("def explode():\n    raise ValueError('boom')\n\nexplode()\n");
        assert_eq!(exc.info, ExceptionInfo::new("ValueError", "boom"));
        let lines: Vec<_> = exc.traceback.iter().map(|f| (f.line, f.function.as_str())).collect();
        assert_eq!(lines, vec![(4, "<script>"), (2, "explode")]);
    }

    #[test]
    fn test_runtime_errors() {
        assert_eq!(raised("1 / 0\n").info.kind, "ZeroDivisionError");
        assert_eq!(raised("missing\n").info.kind, "NameError");
        assert_eq!(raised("[1][3]\n").info.kind, "IndexError");
        assert_eq!(raised("{'a': 1}['b']\n").info.kind, "KeyError");
        assert_eq!(raised("1 + 'a'\n").info.kind, "TypeError");
        assert_eq!(raised("9223372036854775807 + 1\n").info.kind, "OverflowError");
    }

    #[test]
    fn test_sleep_rejects_bad_lengths() {
        assert_eq!(raised("sleep(1e300)\n").info.kind, "OverflowError");
        assert_eq!(raised("sleep(-1)\n").info.kind, "ValueError");
    }

    #[test]
    fn test_printing_cyclic_list() {
        let code = "\
a = [0, 0, 0, 0]
a[0] = a
a[1] = a
a[2] = a
a[3] = a
print(a)
print(a == a)
";
        let (result, _, io) = exec(code);
        assert!(result.is_ok(), "{:?}", result);
        assert_eq!(io.take_stdout(), "[[...], [...], [...], [...]]\nTrue\n");
    }

    #[test]
    fn test_recursion_limit() {
        // Worker threads get a large stack; do the same here.
        let handle = thread::Builder::new()
            .stack_size(crate::execute::WORKER_STACK_SIZE)
            .spawn(|| raised("def f(n):\n    return f(n + 1)\nf(0)\n"))
            .unwrap();
        let exc = handle.join().unwrap();
        assert_eq!(exc.info.kind, "RecursionError");
        assert_eq!(exc.traceback.len(), MAX_DEPTH);
    }

    #[test]
    fn test_syntax_error_is_raised() {
        let exc = raised("x = (1 +\n");
        assert_eq!(exc.info.kind, "SyntaxError");
        assert_eq!(exc.traceback[0].filename, "test.txt");
    }

    #[test]
    fn test_abort_interrupts_infinite_loop() {
        let globals = Namespace::new();
        let locals = Namespace::new();
        let io = BufferedIo::new();
        let abort = AbortHandle::new();

        let trigger = abort.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.abort();
        });

        let result = run("while True:\n    pass\n", "loop.txt", &globals, &locals, &io, &abort);
        stopper.join().unwrap();
        assert_eq!(result, Err(ScriptError::Interrupt));
    }

    #[test]
    fn test_abort_interrupts_sleep() {
        let globals = Namespace::new();
        let locals = Namespace::new();
        let io = BufferedIo::new();
        let abort = AbortHandle::new();
        abort.abort();

        let result = run("sleep(30)\n", "sleep.txt", &globals, &locals, &io, &abort);
        assert_eq!(result, Err(ScriptError::Interrupt));
    }

    #[test]
    fn test_input_reads_lines() {
        let globals = Namespace::new();
        let locals = Namespace::new();
        let io = BufferedIo::new();
        io.push_stdin("42");
        let abort = AbortHandle::new();

        let result = run("n = int(input('n? '))\n", "in.txt", &globals, &locals, &io, &abort);
        assert!(result.is_ok());
        assert!(matches!(locals.get("n"), Some(Value::Int(42))));
        assert_eq!(io.take_stdout(), "n? ");

        let result = run("input()\n", "in.txt", &globals, &locals, &io, &abort);
        match result {
            Err(ScriptError::Raised(exc)) => assert_eq!(exc.info.kind, "EOFError"),
            other => panic!("expected EOFError, got {:?}", other),
        }
    }

    #[test]
    fn test_methods_and_membership() {
        let code = "\
items = []
items.append('a')
append(items, 'b')
m = {'k': 1}
has = 'k' in m and 'z' not in m and 2 in range(0, 4, 2)
joined = ','.join(items)
";
        let (result, locals, _) = exec(code);
        assert!(result.is_ok(), "{:?}", result);
        assert!(matches!(locals.get("has"), Some(Value::Bool(true))));
        assert!(matches!(locals.get("joined"), Some(Value::Str(s)) if s == "a,b"));
    }
}
