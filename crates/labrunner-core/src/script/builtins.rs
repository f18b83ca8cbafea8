//! Builtin functions available to every code unit.

use std::cmp::Ordering;
use std::time::Duration;

use super::exception::{ExceptionInfo, ScriptError};
use super::interp::{Exec, Interpreter};
use super::value::{Value, lock, range_len};

/// Exception kinds that scripts can construct by name.
pub const EXCEPTION_KINDS: &[&str] = &[
    "Exception",
    "ValueError",
    "TypeError",
    "KeyError",
    "IndexError",
    "RuntimeError",
    "NameError",
    "ZeroDivisionError",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Print,
    Eprint,
    Input,
    Sleep,
    Len,
    Range,
    Str,
    Int,
    Float,
    Abs,
    Min,
    Max,
    Type,
    Keys,
    Append,
    /// Constructor for an exception kind.
    Exception(&'static str),
}

impl Builtin {
    pub fn lookup(name: &str) -> Option<Builtin> {
        let builtin = match name {
            "print" => Builtin::Print,
            "eprint" => Builtin::Eprint,
            "input" => Builtin::Input,
            "sleep" => Builtin::Sleep,
            "len" => Builtin::Len,
            "range" => Builtin::Range,
            "str" => Builtin::Str,
            "int" => Builtin::Int,
            "float" => Builtin::Float,
            "abs" => Builtin::Abs,
            "min" => Builtin::Min,
            "max" => Builtin::Max,
            "type" => Builtin::Type,
            "keys" => Builtin::Keys,
            "append" => Builtin::Append,
            other => {
                let kind = EXCEPTION_KINDS.iter().find(|kind| **kind == other)?;
                Builtin::Exception(kind)
            }
        };
        Some(builtin)
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Print => "print",
            Builtin::Eprint => "eprint",
            Builtin::Input => "input",
            Builtin::Sleep => "sleep",
            Builtin::Len => "len",
            Builtin::Range => "range",
            Builtin::Str => "str",
            Builtin::Int => "int",
            Builtin::Float => "float",
            Builtin::Abs => "abs",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Type => "type",
            Builtin::Keys => "keys",
            Builtin::Append => "append",
            Builtin::Exception(kind) => kind,
        }
    }

    pub(crate) fn call(self, interp: &mut Interpreter<'_>, args: Vec<Value>) -> Exec<Value> {
        match self {
            Builtin::Print => {
                interp.io().write_stdout(&join_line(&args));
                Ok(Value::None)
            }
            Builtin::Eprint => {
                interp.io().write_stderr(&join_line(&args));
                Ok(Value::None)
            }
            Builtin::Input => {
                arity(interp, self, &args, 0, 1)?;
                if let Some(prompt) = args.first() {
                    interp.io().write_stdout(&prompt.to_string());
                }
                match interp.io().read_line(interp.abort()) {
                    Some(line) => Ok(Value::Str(line)),
                    None if interp.abort().is_aborted() => Err(ScriptError::Interrupt),
                    None => Err(interp.raise("EOFError", "EOF when reading a line")),
                }
            }
            Builtin::Sleep => {
                arity(interp, self, &args, 1, 1)?;
                let secs = match args[0].as_f64() {
                    Some(secs) if secs >= 0.0 => secs,
                    Some(_) => {
                        return Err(interp.raise("ValueError", "sleep length must be non-negative"));
                    }
                    None => return Err(type_error(interp, self, &args[0])),
                };
                let Ok(duration) = Duration::try_from_secs_f64(secs) else {
                    return Err(interp.raise("OverflowError", "sleep length is too large"));
                };
                if interp.abort().sleep(duration) {
                    Err(ScriptError::Interrupt)
                } else {
                    Ok(Value::None)
                }
            }
            Builtin::Len => {
                arity(interp, self, &args, 1, 1)?;
                let len = match &args[0] {
                    Value::Str(s) => s.chars().count() as i64,
                    Value::List(items) => lock(items).len() as i64,
                    Value::Map(entries) => lock(entries).len() as i64,
                    Value::Range { start, stop, step } => range_len(*start, *stop, *step),
                    Value::Namespace(ns) => ns.len() as i64,
                    other => return Err(type_error(interp, self, other)),
                };
                Ok(Value::Int(len))
            }
            Builtin::Range => {
                arity(interp, self, &args, 1, 3)?;
                let mut ints = Vec::with_capacity(args.len());
                for arg in &args {
                    match arg.as_i64() {
                        Some(v) => ints.push(v),
                        None => return Err(type_error(interp, self, arg)),
                    }
                }
                let (start, stop, step) = match ints.as_slice() {
                    [stop] => (0, *stop, 1),
                    [start, stop] => (*start, *stop, 1),
                    [start, stop, step] => (*start, *stop, *step),
                    _ => unreachable!("arity checked"),
                };
                if step == 0 {
                    return Err(interp.raise("ValueError", "range() arg 3 must not be zero"));
                }
                Ok(Value::Range { start, stop, step })
            }
            Builtin::Str => {
                arity(interp, self, &args, 0, 1)?;
                Ok(Value::Str(args.first().map(Value::to_string).unwrap_or_default()))
            }
            Builtin::Int => {
                arity(interp, self, &args, 1, 1)?;
                match &args[0] {
                    Value::Int(v) => Ok(Value::Int(*v)),
                    Value::Bool(b) => Ok(Value::Int(*b as i64)),
                    Value::Float(v) => {
                        if v.is_finite() && v.abs() < 9.2e18 {
                            Ok(Value::Int(v.trunc() as i64))
                        } else {
                            Err(interp.raise("OverflowError", "cannot convert float to int"))
                        }
                    }
                    Value::Str(s) => s
                        .trim()
                        .replace('_', "")
                        .parse::<i64>()
                        .map(Value::Int)
                        .map_err(|_| {
                            let literal = Value::Str(s.clone()).repr();
                            interp.raise(
                                "ValueError",
                                format!("invalid literal for int(): {}", literal),
                            )
                        }),
                    other => Err(type_error(interp, self, other)),
                }
            }
            Builtin::Float => {
                arity(interp, self, &args, 1, 1)?;
                match &args[0] {
                    Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                        interp.raise(
                            "ValueError",
                            format!(
                                "could not convert string to float: {}",
                                Value::Str(s.clone()).repr()
                            ),
                        )
                    }),
                    other => match other.as_f64() {
                        Some(v) => Ok(Value::Float(v)),
                        None => Err(type_error(interp, self, other)),
                    },
                }
            }
            Builtin::Abs => {
                arity(interp, self, &args, 1, 1)?;
                match &args[0] {
                    Value::Int(v) => v
                        .checked_abs()
                        .map(Value::Int)
                        .ok_or_else(|| interp.raise("OverflowError", "integer overflow")),
                    Value::Bool(b) => Ok(Value::Int(*b as i64)),
                    Value::Float(v) => Ok(Value::Float(v.abs())),
                    other => Err(type_error(interp, self, other)),
                }
            }
            Builtin::Min | Builtin::Max => {
                let single_list = match args.as_slice() {
                    [Value::List(items)] => Some(lock(items).clone()),
                    _ => None,
                };
                let candidates = match single_list {
                    Some(items) => items,
                    None if args.len() == 1 => return Err(type_error(interp, self, &args[0])),
                    None => args,
                };
                if candidates.is_empty() {
                    return Err(interp.raise(
                        "ValueError",
                        format!("{}() arg is an empty sequence", self.name()),
                    ));
                }
                let wanted = if self == Builtin::Min {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                let mut best = candidates[0].clone();
                for candidate in &candidates[1..] {
                    if interp.compare(candidate, &best, "<")? == wanted {
                        best = candidate.clone();
                    }
                }
                Ok(best)
            }
            Builtin::Type => {
                arity(interp, self, &args, 1, 1)?;
                Ok(Value::str(args[0].type_name()))
            }
            Builtin::Keys => {
                arity(interp, self, &args, 1, 1)?;
                let keys = match &args[0] {
                    Value::Map(entries) => lock(entries).keys().cloned().collect(),
                    Value::Namespace(ns) => ns.keys(),
                    other => return Err(type_error(interp, self, other)),
                };
                Ok(Value::list(keys.into_iter().map(Value::Str).collect()))
            }
            Builtin::Append => {
                arity(interp, self, &args, 2, 2)?;
                match &args[0] {
                    Value::List(items) => {
                        lock(items).push(args[1].clone());
                        Ok(Value::None)
                    }
                    other => Err(type_error(interp, self, other)),
                }
            }
            Builtin::Exception(kind) => {
                arity(interp, self, &args, 0, 1)?;
                let message = args.first().map(Value::to_string).unwrap_or_default();
                Ok(Value::Exception(ExceptionInfo::new(kind, message)))
            }
        }
    }
}

fn join_line(args: &[Value]) -> String {
    let mut line = args
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    line.push('\n');
    line
}

fn arity(
    interp: &Interpreter<'_>,
    builtin: Builtin,
    args: &[Value],
    min: usize,
    max: usize,
) -> Exec<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{}", min)
        } else {
            format!("{} to {}", min, max)
        };
        return Err(interp.raise(
            "TypeError",
            format!(
                "{}() takes {} arguments but {} were given",
                builtin.name(),
                expected,
                args.len()
            ),
        ));
    }
    Ok(())
}

fn type_error(interp: &Interpreter<'_>, builtin: Builtin, arg: &Value) -> ScriptError {
    interp.raise(
        "TypeError",
        format!(
            "{}() does not accept an argument of type '{}'",
            builtin.name(),
            arg.type_name()
        ),
    )
}
