// File: src/native.rs
//
// The native bridge (spec §5, component C5): built-in globals, the `std`
// module tree, and the attribute/method table backing `GetAttr`/`SetAttr`
// for array/map/string/result values. Every native function shares one
// call signature — `Fn(&mut Vm, &[Value]) -> Result<Value, PyleError>` —
// since Rust has no runtime reflection to dispatch on name/arity the way a
// host language with introspection could (spec §9's resolved design).
//
// Dispatch is two-tiered (spec §4.5): a handful of fixed-arity, side-effect-
// free globals are also registered in `DIRECT_CALL_TABLE`, a plain `fn`
// pointer keyed by `(name, arity)` and checked by `Vm::call_value` before it
// falls back to the reflective `Rc<dyn Fn>` path every native function goes
// through regardless. The direct table is a fast path, not the only path —
// closures, variadics, and anything capturing state still go through
// `NativeFunction::call`.

use crate::ast::Token;
use crate::errors::{PyleError, RuntimeErrorKind, SourceLocation};
use crate::module::ModuleCtor;
use crate::value::{stringify_value, BoundMethod, ModuleValue, NativeFunction, Value};
use crate::vm::Vm;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::rc::Rc;

fn native(
    name: &str,
    doc: Option<&str>,
    min: usize,
    max: Option<usize>,
    f: impl Fn(&mut Vm, &[Value]) -> Result<Value, PyleError> + 'static,
) -> Value {
    Value::NativeFunction(Rc::new(NativeFunction {
        name: Rc::from(name),
        doc: doc.map(Rc::from),
        min_arity: min,
        max_arity: max,
        call: Rc::new(f),
    }))
}

fn native_fn(
    name: &str,
    doc: Option<&str>,
    min: usize,
    max: Option<usize>,
    f: impl Fn(&mut Vm, &[Value]) -> Result<Value, PyleError> + 'static,
) -> Rc<NativeFunction> {
    match native(name, doc, min, max, f) {
        Value::NativeFunction(nf) => nf,
        _ => unreachable!(),
    }
}

// --- direct-call table ---------------------------------------------------

type DirectFn = fn(&mut Vm, &[Value]) -> Result<Value, PyleError>;

fn direct_len(_vm: &mut Vm, args: &[Value]) -> Result<Value, PyleError> {
    length_of(&args[0])
}

fn direct_type_of(_vm: &mut Vm, args: &[Value]) -> Result<Value, PyleError> {
    Ok(Value::string(args[0].type_name()))
}

fn direct_ok(_vm: &mut Vm, args: &[Value]) -> Result<Value, PyleError> {
    Ok(Value::ok(args[0].clone()))
}

fn direct_err(_vm: &mut Vm, args: &[Value]) -> Result<Value, PyleError> {
    Ok(Value::err(args[0].clone()))
}

static DIRECT_CALL_TABLE: Lazy<HashMap<(&'static str, usize), DirectFn>> = Lazy::new(|| {
    let mut m: HashMap<(&'static str, usize), DirectFn> = HashMap::new();
    m.insert(("len", 1), direct_len as DirectFn);
    m.insert(("type_of", 1), direct_type_of as DirectFn);
    m.insert(("ok", 1), direct_ok as DirectFn);
    m.insert(("err", 1), direct_err as DirectFn);
    m
});

/// Looks up `name`/`args.len()` in the direct-call table. `Some` short-
/// circuits the reflective arity-checked path entirely.
pub fn try_direct_call(name: &str, vm: &mut Vm, args: &[Value]) -> Option<Result<Value, PyleError>> {
    DIRECT_CALL_TABLE.get(&(name, args.len())).map(|f| f(vm, args))
}

fn loc() -> SourceLocation {
    SourceLocation::unknown()
}

fn type_err(msg: impl Into<String>) -> PyleError {
    PyleError::runtime(RuntimeErrorKind::TypeMismatch, msg, loc())
}

// --- always-available globals -------------------------------------------

pub fn builtin_globals() -> Vec<(&'static str, Rc<NativeFunction>)> {
    vec![
        ("print", native_fn("print", Some("Writes its arguments to stdout, space-separated."), 0, None, |_vm, args| {
            let rendered: Vec<String> = args.iter().map(stringify_value).collect();
            println!("{}", rendered.join(" "));
            Ok(Value::Null)
        })),
        ("len", native_fn("len", Some("Returns the length of a string, array, tuple, or map."), 1, Some(1), |_vm, args| length_of(&args[0]))),
        ("type_of", native_fn("type_of", Some("Returns the type name of a value as a string."), 1, Some(1), |_vm, args| Ok(Value::string(args[0].type_name())))),
        ("ok", native_fn("ok", Some("Wraps a value as a successful Result."), 1, Some(1), |_vm, args| Ok(Value::ok(args[0].clone())))),
        ("err", native_fn("err", Some("Wraps a value as a failed Result."), 1, Some(1), |_vm, args| Ok(Value::err(args[0].clone())))),
    ]
}

fn length_of(v: &Value) -> Result<Value, PyleError> {
    let n = match v {
        Value::Str(s) => s.chars().count(),
        Value::Array(a) => a.borrow().len(),
        Value::Tuple(t) => t.len(),
        Value::Map(m) => m.borrow().len(),
        other => return Err(type_err(format!("'{}' has no length", other.type_name()))),
    };
    Ok(Value::Int(n as i64))
}

// --- std module ----------------------------------------------------------

pub fn builtin_modules() -> Vec<(&'static str, ModuleCtor)> {
    vec![("std", build_std_module)]
}

fn build_std_module() -> ModuleValue {
    let mut attrs = HashMap::new();
    attrs.insert("print".to_string(), native("print", Some("Writes its arguments to stdout, space-separated."), 0, None, |_vm, args| {
        let rendered: Vec<String> = args.iter().map(stringify_value).collect();
        println!("{}", rendered.join(" "));
        Ok(Value::Null)
    }));
    attrs.insert("len".to_string(), native("len", Some("Returns the length of a string, array, tuple, or map."), 1, Some(1), |_vm, args| length_of(&args[0])));
    attrs.insert(
        "math".to_string(),
        Value::Module(Rc::new(build_math_module())),
    );
    attrs.insert(
        "string".to_string(),
        Value::Module(Rc::new(build_string_module())),
    );
    ModuleValue { name: Rc::from("std"), attrs }
}

fn build_math_module() -> ModuleValue {
    let mut attrs = HashMap::new();
    attrs.insert(
        "sqrt".to_string(),
        native("sqrt", Some("Returns the square root of a number as a float."), 1, Some(1), |_vm, args| {
            Ok(Value::Float(as_f64(&args[0])?.sqrt()))
        }),
    );
    attrs.insert("abs".to_string(), native("abs", None, 1, Some(1), |_vm, args| match &args[0] {
        Value::Int(n) => Ok(Value::Int(n.abs())),
        Value::Float(n) => Ok(Value::Float(n.abs())),
        other => Err(type_err(format!("abs expects a number, got '{}'", other.type_name()))),
    }));
    attrs.insert("floor".to_string(), native("floor", None, 1, Some(1), |_vm, args| Ok(Value::Int(as_f64(&args[0])?.floor() as i64))));
    attrs.insert("ceil".to_string(), native("ceil", None, 1, Some(1), |_vm, args| Ok(Value::Int(as_f64(&args[0])?.ceil() as i64))));
    attrs.insert("pow".to_string(), native("pow", None, 2, Some(2), |_vm, args| {
        Ok(Value::Float(as_f64(&args[0])?.powf(as_f64(&args[1])?)))
    }));
    attrs.insert("min".to_string(), native("min", None, 2, Some(2), |_vm, args| {
        if as_f64(&args[0])? <= as_f64(&args[1])? { Ok(args[0].clone()) } else { Ok(args[1].clone()) }
    }));
    attrs.insert("max".to_string(), native("max", None, 2, Some(2), |_vm, args| {
        if as_f64(&args[0])? >= as_f64(&args[1])? { Ok(args[0].clone()) } else { Ok(args[1].clone()) }
    }));
    ModuleValue { name: Rc::from("std.math"), attrs }
}

fn build_string_module() -> ModuleValue {
    let mut attrs = HashMap::new();
    attrs.insert("upper".to_string(), native("upper", None, 1, Some(1), |_vm, args| Ok(Value::string(as_str(&args[0])?.to_uppercase()))));
    attrs.insert("lower".to_string(), native("lower", None, 1, Some(1), |_vm, args| Ok(Value::string(as_str(&args[0])?.to_lowercase()))));
    attrs.insert("trim".to_string(), native("trim", None, 1, Some(1), |_vm, args| Ok(Value::string(as_str(&args[0])?.trim().to_string()))));
    attrs.insert("split".to_string(), native("split", None, 2, Some(2), |_vm, args| {
        let s = as_str(&args[0])?;
        let sep = as_str(&args[1])?;
        let parts: Vec<Value> = s.split(sep.as_str()).map(Value::string).collect();
        Ok(Value::array(parts))
    }));
    attrs.insert("join".to_string(), native("join", None, 2, Some(2), |_vm, args| {
        let sep = as_str(&args[0])?;
        let items = match &args[1] {
            Value::Array(a) => a.borrow().clone(),
            other => return Err(type_err(format!("join expects an array, got '{}'", other.type_name()))),
        };
        let parts: Vec<String> = items.iter().map(stringify_value).collect();
        Ok(Value::string(parts.join(&sep)))
    }));
    ModuleValue { name: Rc::from("std.string"), attrs }
}

fn as_f64(v: &Value) -> Result<f64, PyleError> {
    match v {
        Value::Int(n) => Ok(*n as f64),
        Value::Float(n) => Ok(*n),
        other => Err(type_err(format!("expected a number, got '{}'", other.type_name()))),
    }
}

fn as_str(v: &Value) -> Result<Rc<str>, PyleError> {
    match v {
        Value::Str(s) => Ok(s.clone()),
        other => Err(type_err(format!("expected a string, got '{}'", other.type_name()))),
    }
}

// --- attribute / method dispatch for GetAttr/SetAttr --------------------

/// Resolves `receiver.name` (spec §4.1's attribute-access capability):
/// method names bind to a `BoundMethod`; for maps, any other name falls
/// back to a string-keyed entry lookup, with method names taking priority.
pub fn get_attr(_vm: &mut Vm, receiver: &Value, name: &str, token: &Token) -> Result<Value, PyleError> {
    if let Some(method) = array_method(name) {
        if matches!(receiver, Value::Array(_)) {
            return Ok(bound(receiver, method));
        }
    }
    if let Some(method) = string_method(name) {
        if matches!(receiver, Value::Str(_)) {
            return Ok(bound(receiver, method));
        }
    }
    if let Some(method) = map_method(name) {
        if matches!(receiver, Value::Map(_)) {
            return Ok(bound(receiver, method));
        }
    }

    match receiver {
        Value::Map(m) => m.borrow().get(&Value::string(name))?.ok_or_else(|| missing_attr(receiver, name, token)),
        Value::Module(m) => m.attrs.get(name).cloned().ok_or_else(|| missing_attr(receiver, name, token)),
        Value::Result(r) => match name {
            "is_ok" => Ok(Value::Bool(r.error.is_none())),
            "is_err" => Ok(Value::Bool(r.error.is_some())),
            "value" => Ok(r.value.clone()),
            "error" => Ok(r.error.clone().unwrap_or(Value::Null)),
            _ => Err(missing_attr(receiver, name, token)),
        },
        Value::Error(msg) if name == "message" => Ok(Value::string(msg.to_string())),
        _ => Err(missing_attr(receiver, name, token)),
    }
}

pub fn set_attr(receiver: &Value, name: &str, value: Value, token: &Token) -> Result<(), PyleError> {
    match receiver {
        Value::Map(m) => {
            m.borrow_mut().insert(Value::string(name), value)?;
            Ok(())
        }
        other => Err(PyleError::runtime(
            RuntimeErrorKind::TypeMismatch,
            format!("cannot set attribute on '{}'", other.type_name()),
            loc_of(token),
        )),
    }
}

fn loc_of(token: &Token) -> SourceLocation {
    SourceLocation::with_file(token.line, token.col_start, token.file.clone())
}

fn missing_attr(receiver: &Value, name: &str, token: &Token) -> PyleError {
    PyleError::runtime(
        RuntimeErrorKind::MissingAttribute,
        format!("'{}' has no attribute '{}'", receiver.type_name(), name),
        loc_of(token),
    )
}

fn bound(receiver: &Value, method: Rc<NativeFunction>) -> Value {
    Value::BoundMethod(Rc::new(BoundMethod { receiver: receiver.clone(), method: Value::NativeFunction(method) }))
}

fn array_method(name: &str) -> Option<Rc<NativeFunction>> {
    Some(match name {
        "push" => native_fn("push", None, 2, Some(2), |_vm, args| {
            let a = as_array(&args[0])?;
            a.borrow_mut().push(args[1].clone());
            Ok(Value::Null)
        }),
        "pop" => native_fn("pop", None, 1, Some(1), |_vm, args| {
            let a = as_array(&args[0])?;
            a.borrow_mut().pop().ok_or_else(|| type_err("pop from empty array"))
        }),
        "contains" => native_fn("contains", None, 2, Some(2), |_vm, args| {
            let a = as_array(&args[0])?;
            Ok(Value::Bool(a.borrow().iter().any(|v| crate::value::values_equal(v, &args[1]))))
        }),
        "sort" => native_fn("sort", None, 1, Some(1), |_vm, args| {
            let a = as_array(&args[0])?;
            let mut items = a.borrow().clone();
            items.sort_by(|x, y| crate::value::compare_values(x, y).unwrap_or(std::cmp::Ordering::Equal));
            *a.borrow_mut() = items;
            Ok(Value::Null)
        }),
        "map" => native_fn(
            "map",
            Some("Calls a function with each element and collects the results into a new array."),
            2,
            Some(2),
            |vm, args| {
                let a = as_array(&args[0])?;
                let items = a.borrow().clone();
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(vm.call_value(&args[1], vec![item])?);
                }
                Ok(Value::array(out))
            },
        ),
        "filter" => native_fn("filter", None, 2, Some(2), |vm, args| {
            let a = as_array(&args[0])?;
            let items = a.borrow().clone();
            let mut out = Vec::new();
            for item in items {
                if vm.call_value(&args[1], vec![item.clone()])?.is_truthy() {
                    out.push(item);
                }
            }
            Ok(Value::array(out))
        }),
        "reduce" => native_fn("reduce", None, 3, Some(3), |vm, args| {
            let a = as_array(&args[0])?;
            let items = a.borrow().clone();
            let mut acc = args[2].clone();
            for item in items {
                acc = vm.call_value(&args[1], vec![acc, item])?;
            }
            Ok(acc)
        }),
        _ => return None,
    })
}

fn string_method(name: &str) -> Option<Rc<NativeFunction>> {
    Some(match name {
        "upper" => native_fn("upper", None, 1, Some(1), |_vm, args| Ok(Value::string(as_str(&args[0])?.to_uppercase()))),
        "lower" => native_fn("lower", None, 1, Some(1), |_vm, args| Ok(Value::string(as_str(&args[0])?.to_lowercase()))),
        "trim" => native_fn("trim", None, 1, Some(1), |_vm, args| Ok(Value::string(as_str(&args[0])?.trim().to_string()))),
        "contains" => native_fn("contains", None, 2, Some(2), |_vm, args| {
            Ok(Value::Bool(as_str(&args[0])?.contains(as_str(&args[1])?.as_ref())))
        }),
        "starts_with" => native_fn("starts_with", None, 2, Some(2), |_vm, args| {
            Ok(Value::Bool(as_str(&args[0])?.starts_with(as_str(&args[1])?.as_ref())))
        }),
        "ends_with" => native_fn("ends_with", None, 2, Some(2), |_vm, args| {
            Ok(Value::Bool(as_str(&args[0])?.ends_with(as_str(&args[1])?.as_ref())))
        }),
        "split" => native_fn("split", None, 2, Some(2), |_vm, args| {
            let s = as_str(&args[0])?;
            let sep = as_str(&args[1])?;
            Ok(Value::array(s.split(sep.as_ref()).map(Value::string).collect()))
        }),
        _ => return None,
    })
}

fn map_method(name: &str) -> Option<Rc<NativeFunction>> {
    Some(match name {
        "keys" => native_fn("keys", None, 1, Some(1), |_vm, args| Ok(Value::array(as_map(&args[0])?.borrow().keys_sorted()))),
        "values" => native_fn("values", None, 1, Some(1), |_vm, args| Ok(Value::array(as_map(&args[0])?.borrow().values_sorted()))),
        "contains" => native_fn("contains", None, 2, Some(2), |_vm, args| Ok(Value::Bool(as_map(&args[0])?.borrow().contains_key(&args[1])?))),
        _ => return None,
    })
}

fn as_array(v: &Value) -> Result<std::rc::Rc<std::cell::RefCell<Vec<Value>>>, PyleError> {
    match v {
        Value::Array(a) => Ok(a.clone()),
        other => Err(type_err(format!("expected an array, got '{}'", other.type_name()))),
    }
}

fn as_map(v: &Value) -> Result<std::rc::Rc<std::cell::RefCell<crate::value::PyleMap>>, PyleError> {
    match v {
        Value::Map(m) => Ok(m.clone()),
        other => Err(type_err(format!("expected a map, got '{}'", other.type_name()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_of_string_counts_chars() {
        assert!(matches!(length_of(&Value::string("hello")).unwrap(), Value::Int(5)));
    }

    #[test]
    fn math_module_exposes_sqrt() {
        let m = build_math_module();
        assert!(m.attrs.contains_key("sqrt"));
    }
}
