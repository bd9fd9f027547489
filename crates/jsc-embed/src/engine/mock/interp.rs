//! Tree-walking evaluator over the mock heap

use parking_lot::MutexGuard;
use std::collections::HashMap;

use super::script::{BinOp, Expr, Line, Stmt};
use super::{Callable, Class, Heap, Native, Slot, UNDEFINED, handle};
use crate::engine::{NativeHandle, NativeResult, Thrown};

const MAX_CALL_DEPTH: usize = 200;
/// Largest dense array or typed array the mock heap will allocate
const MAX_ARRAY_LENGTH: usize = 1 << 24;

struct Completion {
    value: usize,
    returned: bool,
}

/// Variables visible to the statement being run. `None` at top level,
/// where declarations land on the global object.
type Locals = Option<HashMap<String, usize>>;

/// Runs with the heap locked; the lock is only released around host calls
pub(super) struct Interp<'h, 'g> {
    heap: &'h mut MutexGuard<'g, Heap>,
    ctx: usize,
    source_url: Option<String>,
    line: Option<i32>,
    depth: usize,
}

impl<'h, 'g> Interp<'h, 'g> {
    pub(super) fn new(
        heap: &'h mut MutexGuard<'g, Heap>,
        ctx: usize,
        source_url: Option<&str>,
    ) -> Self {
        Self {
            heap,
            ctx,
            source_url: source_url.map(str::to_string),
            line: None,
            depth: 0,
        }
    }

    fn global(&self) -> usize {
        self.heap.global_of(self.ctx)
    }

    fn throw(&mut self, name: &str, message: impl AsRef<str>) -> Thrown {
        let error = self
            .heap
            .error(name, message.as_ref(), self.source_url.as_deref(), self.line);
        Thrown(handle(error))
    }

    pub(super) fn run_script(&mut self, body: &[Line], this: usize) -> NativeResult<usize> {
        let mut locals = None;
        Ok(self.run(body, &mut locals, this)?.value)
    }

    fn run(&mut self, body: &[Line], locals: &mut Locals, this: usize) -> NativeResult<Completion> {
        let mut value = UNDEFINED;
        for Line { line, stmt } in body {
            self.line = Some(*line);
            match stmt {
                Stmt::Expr(expr) => value = self.eval(expr, locals, this)?,
                Stmt::Declare(name, expr) => {
                    let declared = self.eval(expr, locals, this)?;
                    match locals {
                        Some(scope) => {
                            scope.insert(name.clone(), declared);
                        }
                        None => {
                            let global = self.global();
                            self.set(global, name, declared)?;
                        }
                    }
                }
                Stmt::Assign(target, expr) => value = self.assign(target, expr, locals, this)?,
                Stmt::Throw(expr) => {
                    let thrown = self.eval(expr, locals, this)?;
                    return Err(Thrown(handle(thrown)));
                }
                Stmt::Return(expr) => {
                    let value = match expr {
                        Some(expr) => self.eval(expr, locals, this)?,
                        None => UNDEFINED,
                    };
                    return Ok(Completion {
                        value,
                        returned: true,
                    });
                }
            }
        }
        Ok(Completion {
            value,
            returned: false,
        })
    }

    fn assign(
        &mut self,
        target: &Expr,
        expr: &Expr,
        locals: &mut Locals,
        this: usize,
    ) -> NativeResult<usize> {
        match target {
            Expr::Ident(name) => {
                let value = self.eval(expr, locals, this)?;
                match locals {
                    Some(scope) if scope.contains_key(name) => {
                        scope.insert(name.clone(), value);
                    }
                    _ => {
                        let global = self.global();
                        self.set(global, name, value)?;
                    }
                }
                Ok(value)
            }
            Expr::Member(object, name) => {
                let object = self.eval(object, locals, this)?;
                let value = self.eval(expr, locals, this)?;
                self.set(object, name, value)?;
                Ok(value)
            }
            Expr::Index(object, index) => {
                let object = self.eval(object, locals, this)?;
                let key = self.eval(index, locals, this)?;
                let key = self.heap.to_string(key);
                let value = self.eval(expr, locals, this)?;
                self.set(object, &key, value)?;
                Ok(value)
            }
            _ => Err(self.throw("SyntaxError", "Invalid left-hand side in assignment")),
        }
    }

    fn lookup(&mut self, name: &str, locals: &Locals) -> NativeResult<usize> {
        if let Some(value) = locals.as_ref().and_then(|scope| scope.get(name)) {
            return Ok(*value);
        }
        let global = self.global();
        let found = self
            .heap
            .get_object(global)
            .and_then(|object| object.props.get(name).copied());
        match found {
            Some(value) => Ok(value),
            None => Err(self.throw("ReferenceError", format!("Can't find variable: {}", name))),
        }
    }

    fn eval(&mut self, expr: &Expr, locals: &mut Locals, this: usize) -> NativeResult<usize> {
        match expr {
            Expr::Number(n) => Ok(self.heap.number(*n)),
            Expr::Str(s) => Ok(self.heap.string(s.as_str())),
            Expr::Bool(b) => Ok(self.heap.boolean(*b)),
            Expr::Null => Ok(super::NULL),
            Expr::Undefined => Ok(UNDEFINED),
            Expr::This => Ok(this),
            Expr::Ident(name) => self.lookup(name, locals),
            Expr::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, locals, this)?);
                }
                Ok(self.heap.object(Class::Array(values)))
            }
            Expr::Object(properties) => {
                let object = self.heap.object(Class::Plain);
                for (key, value) in properties {
                    let value = self.eval(value, locals, this)?;
                    self.set(object, key, value)?;
                }
                Ok(object)
            }
            Expr::Function(def) => Ok(self.heap.object(Class::Function(def.clone()))),
            Expr::Neg(operand) => {
                let value = self.eval(operand, locals, this)?;
                let n = self.heap.to_number(value);
                Ok(self.heap.number(-n))
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left, locals, this)?;
                let right = self.eval(right, locals, this)?;
                Ok(self.binary(*op, left, right))
            }
            Expr::Member(object, name) => {
                let object = self.eval(object, locals, this)?;
                self.get(object, name)
            }
            Expr::Index(object, index) => {
                let object = self.eval(object, locals, this)?;
                let key = self.eval(index, locals, this)?;
                let key = self.heap.to_string(key);
                self.get(object, &key)
            }
            Expr::Call(callee, args) => {
                let (function, receiver) = match callee.as_ref() {
                    Expr::Member(object, name) => {
                        let object = self.eval(object, locals, this)?;
                        (self.get(object, name)?, object)
                    }
                    other => (self.eval(other, locals, this)?, UNDEFINED),
                };
                let args = self.eval_args(args, locals, this)?;
                self.call(function, receiver, &args, &describe(callee))
            }
            Expr::New(callee, args) => {
                let constructor = self.eval(callee, locals, this)?;
                let args = self.eval_args(args, locals, this)?;
                self.construct(constructor, &args, &describe(callee))
            }
        }
    }

    fn eval_args(&mut self, args: &[Expr], locals: &mut Locals, this: usize) -> NativeResult<Vec<usize>> {
        args.iter().map(|arg| self.eval(arg, locals, this)).collect()
    }

    fn binary(&mut self, op: BinOp, left: usize, right: usize) -> usize {
        let concat = op == BinOp::Add
            && [left, right].iter().any(|v| {
                matches!(
                    self.heap.slots.get(v),
                    Some(Slot::String(_)) | Some(Slot::Object(_))
                )
            });
        if concat {
            let text = self.heap.to_string(left) + &self.heap.to_string(right);
            return self.heap.string(text);
        }
        let (a, b) = (self.heap.to_number(left), self.heap.to_number(right));
        let result = match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
            BinOp::Rem => a % b,
        };
        self.heap.number(result)
    }

    pub(super) fn call(
        &mut self,
        function: usize,
        this: usize,
        args: &[usize],
        description: &str,
    ) -> NativeResult<usize> {
        match self.heap.callable(function) {
            Some(Callable::Script(def)) => {
                if self.depth >= MAX_CALL_DEPTH {
                    return Err(self.throw("RangeError", "Maximum call stack size exceeded."));
                }
                let mut scope = HashMap::new();
                for (i, param) in def.params.iter().enumerate() {
                    scope.insert(param.clone(), args.get(i).copied().unwrap_or(UNDEFINED));
                }
                let this = match self.heap.value_type(this) {
                    crate::engine::JsType::Undefined | crate::engine::JsType::Null => self.global(),
                    _ => this,
                };

                let saved_line = self.line;
                self.depth += 1;
                let result = self.run(&def.body, &mut Some(scope), this);
                self.depth -= 1;
                self.line = saved_line;

                let completion = result?;
                Ok(if completion.returned {
                    completion.value
                } else {
                    UNDEFINED
                })
            }
            Some(Callable::Native(Native::Error(name))) => Ok(self.new_error(name, args)),
            Some(Callable::Native(Native::TypedArray(kind))) => Err(self.throw(
                "TypeError",
                format!("calling {} constructor without new is invalid", kind.name()),
            )),
            Some(Callable::Host(callback)) => {
                let ctx = handle(self.ctx);
                let this = handle(this);
                let args: Vec<NativeHandle> = args.iter().copied().map(handle).collect();
                let result = MutexGuard::unlocked(self.heap, || callback(ctx, this, &args))?;
                Ok(result.non_null().map_or(UNDEFINED, NativeHandle::raw))
            }
            None => {
                let message = format!("{} is not a function. (In '{}()', '{}' is {})",
                    description, description, description, self.heap.type_name(function));
                Err(self.throw("TypeError", message))
            }
        }
    }

    pub(super) fn construct(
        &mut self,
        constructor: usize,
        args: &[usize],
        description: &str,
    ) -> NativeResult<usize> {
        match self.heap.callable(constructor) {
            Some(Callable::Script(_)) => {
                let object = self.heap.object(Class::Plain);
                let result = self.call(constructor, object, args, description)?;
                Ok(if self.heap.is_object(result) { result } else { object })
            }
            Some(Callable::Native(Native::Error(name))) => Ok(self.new_error(name, args)),
            Some(Callable::Native(Native::TypedArray(kind))) => {
                let source = args.first().copied().unwrap_or(UNDEFINED);
                let data = match self.heap.get_object(source).map(|o| &o.class) {
                    Some(Class::Array(items)) => items
                        .iter()
                        .map(|item| kind.coerce(self.heap.to_number(*item)))
                        .collect(),
                    Some(Class::TypedArray(_, data)) => {
                        data.iter().map(|n| kind.coerce(*n)).collect()
                    }
                    Some(_) => Vec::new(),
                    None => {
                        let length = match self.heap.value_type(source) {
                            crate::engine::JsType::Undefined => 0.0,
                            _ => self.heap.to_number(source),
                        };
                        if !(length >= 0.0 && length.fract() == 0.0) {
                            return Err(self.throw("RangeError", "length must be a positive integer"));
                        }
                        if length > MAX_ARRAY_LENGTH as f64 {
                            return Err(self.throw(
                                "RangeError",
                                "Array size is not a small enough positive integer.",
                            ));
                        }
                        vec![0.0; length as usize]
                    }
                };
                Ok(self.heap.object(Class::TypedArray(kind, data)))
            }
            Some(Callable::Host(_)) | None => Err(self.throw(
                "TypeError",
                format!("{} is not a constructor", description),
            )),
        }
    }

    fn new_error(&mut self, name: &str, args: &[usize]) -> usize {
        let message = match args.first() {
            Some(&arg) if arg != UNDEFINED => self.heap.to_string(arg),
            _ => String::new(),
        };
        self.heap
            .error(name, &message, self.source_url.as_deref(), self.line)
    }

    pub(super) fn get(&mut self, object: usize, name: &str) -> NativeResult<usize> {
        let index = name.parse::<usize>().ok();
        let found = match self.heap.slots.get(&object) {
            None | Some(Slot::Undefined) | Some(Slot::Null) => {
                let kind = self.heap.type_name(object);
                return Err(self.throw(
                    "TypeError",
                    format!("{} is not an object (evaluating '{}')", kind, name),
                ));
            }
            Some(Slot::Boolean(_)) | Some(Slot::Number(_)) => None,
            Some(Slot::String(s)) => {
                if name == "length" {
                    let length = s.chars().count() as f64;
                    return Ok(self.heap.number(length));
                }
                match index.and_then(|i| s.chars().nth(i)) {
                    Some(c) => return Ok(self.heap.string(c.to_string())),
                    None => None,
                }
            }
            Some(Slot::Object(o)) => match (&o.class, index) {
                (Class::Array(items), _) if name == "length" => {
                    let length = items.len() as f64;
                    return Ok(self.heap.number(length));
                }
                (Class::Array(items), Some(i)) if i < items.len() => Some(items[i]),
                (Class::TypedArray(_, data), _) if name == "length" => {
                    let length = data.len() as f64;
                    return Ok(self.heap.number(length));
                }
                (Class::TypedArray(_, data), Some(i)) => match data.get(i).copied() {
                    Some(n) => return Ok(self.heap.number(n)),
                    None => Some(UNDEFINED),
                },
                (Class::Function(def), _) if name == "name" => {
                    let fname = def.name.clone().unwrap_or_default();
                    return Ok(self.heap.string(fname));
                }
                (Class::Host(fname), _) if name == "name" => {
                    let fname = fname.clone();
                    return Ok(self.heap.string(fname));
                }
                (Class::Function(def), _) if name == "length" => {
                    let length = def.params.len() as f64;
                    return Ok(self.heap.number(length));
                }
                _ => o.props.get(name).copied(),
            },
        };
        Ok(found.unwrap_or(UNDEFINED))
    }

    pub(super) fn set(&mut self, object: usize, name: &str, value: usize) -> NativeResult<()> {
        let number = self.heap.to_number(value);
        let index = name.parse::<usize>().ok();
        let is_array = matches!(
            self.heap.get_object(object).map(|o| &o.class),
            Some(Class::Array(_))
        );
        let valid_length =
            number >= 0.0 && number.fract() == 0.0 && number <= MAX_ARRAY_LENGTH as f64;
        if is_array && name == "length" && !valid_length {
            return Err(self.throw("RangeError", "Invalid array length"));
        }
        // Far indices stay ordinary properties instead of growing the array
        let index = index.filter(|&i| i < MAX_ARRAY_LENGTH);
        match self.heap.slots.get_mut(&object) {
            None | Some(Slot::Undefined) | Some(Slot::Null) => {
                let kind = self.heap.type_name(object);
                Err(self.throw(
                    "TypeError",
                    format!("{} is not an object (evaluating '{}')", kind, name),
                ))
            }
            Some(Slot::Object(o)) => {
                match (&mut o.class, index) {
                    (Class::Array(items), Some(i)) => {
                        if i >= items.len() {
                            items.resize(i + 1, UNDEFINED);
                        }
                        items[i] = value;
                    }
                    (Class::Array(items), None) if name == "length" => {
                        items.resize(number as usize, UNDEFINED);
                    }
                    (Class::TypedArray(kind, data), Some(i)) => {
                        let kind = *kind;
                        if let Some(slot) = data.get_mut(i) {
                            *slot = kind.coerce(number);
                        }
                    }
                    (Class::TypedArray(..), None) if name == "length" => {}
                    _ => {
                        o.props.insert(name.to_string(), value);
                    }
                }
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }
}

fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Ident(name) => name.clone(),
        Expr::Member(object, name) => format!("{}.{}", describe(object), name),
        Expr::This => "this".to_string(),
        _ => "expression".to_string(),
    }
}
