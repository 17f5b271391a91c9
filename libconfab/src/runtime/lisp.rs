// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The reference runtime: a small interactively evaluated
//! s-expression language whose forms and values are the protocol's
//! readable data terms. Vars defined with `def` live in process-wide
//! namespaces shared by every session, matching how interactive
//! runtimes scope definitions; the per-session state is the current
//! namespace name, the value history, and the printer toggles.

use std::{
    cmp,
    collections::HashMap,
    sync::{atomic::Ordering, Mutex},
    thread, time,
};

use confab_protocol::{key_token, read_from_str, Value};

use super::{EvalContext, EvalError, PrinterPrefs, Runtime};

/// How often a blocking builtin wakes up to poll the interrupt flag.
const INTERRUPT_POLL: time::Duration = time::Duration::from_millis(10);

/// Flat renderings longer than this get broken across lines by the
/// pretty printer.
const PRETTY_WIDTH: usize = 60;

pub struct LispRuntime {
    namespaces: Mutex<HashMap<String, HashMap<String, Value>>>,
}

impl LispRuntime {
    pub fn new() -> LispRuntime {
        let mut namespaces = HashMap::new();
        namespaces.insert(String::from(crate::consts::DEFAULT_NS), HashMap::new());
        LispRuntime { namespaces: Mutex::new(namespaces) }
    }

    fn eval_form(&self, ctx: &mut EvalContext<'_>, form: &Value) -> Result<Value, EvalError> {
        if ctx.interrupt.load(Ordering::Acquire) {
            return Err(EvalError::interrupt());
        }
        match form {
            Value::Sym(name) => self.resolve(ctx, name),
            Value::List(items) => {
                let Some(head) = items.first() else {
                    return Ok(Value::List(vec![]));
                };
                let Value::Sym(op) = head else {
                    return Err(EvalError::new(format!("cannot call {head} as a function")));
                };
                match op.as_str() {
                    "def" => self.eval_def(ctx, &items[1..]),
                    "quote" => Ok(items.get(1).cloned().unwrap_or(Value::Nil)),
                    "if" => self.eval_if(ctx, &items[1..]),
                    "do" => self.eval_do(ctx, &items[1..]),
                    "in-ns" => self.eval_in_ns(ctx, &items[1..]),
                    "loop" => self.eval_loop(ctx, &items[1..]),
                    _ => {
                        let mut args = Vec::with_capacity(items.len() - 1);
                        for item in &items[1..] {
                            args.push(self.eval_form(ctx, item)?);
                        }
                        self.apply(ctx, op, args)
                    }
                }
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve(&self, ctx: &EvalContext<'_>, name: &str) -> Result<Value, EvalError> {
        match name {
            "*1" => Ok(ctx.v1.clone().unwrap_or(Value::Nil)),
            "*2" => Ok(ctx.v2.clone().unwrap_or(Value::Nil)),
            "*3" => Ok(ctx.v3.clone().unwrap_or(Value::Nil)),
            "*e" => Ok(ctx
                .last_exception
                .as_ref()
                .map(|e| Value::str(e.message.clone()))
                .unwrap_or(Value::Nil)),
            "*ns*" => Ok(Value::sym(ctx.ns.clone())),
            _ => self.lookup_var(&ctx.ns, name).ok_or_else(|| {
                EvalError::new(format!(
                    "unable to resolve symbol '{name}' in namespace '{}'",
                    ctx.ns
                ))
            }),
        }
    }

    fn lookup_var(&self, ns: &str, name: &str) -> Option<Value> {
        let namespaces = self.namespaces.lock().unwrap();
        namespaces.get(ns).and_then(|vars| vars.get(name)).cloned()
    }

    fn eval_def(&self, ctx: &mut EvalContext<'_>, args: &[Value]) -> Result<Value, EvalError> {
        let (name, expr) = match args {
            [Value::Sym(name), expr] => (name.clone(), expr),
            _ => return Err(EvalError::new("def expects a symbol and a value form")),
        };
        let value = self.eval_form(ctx, expr)?;
        let mut namespaces = self.namespaces.lock().unwrap();
        namespaces.entry(ctx.ns.clone()).or_default().insert(name.clone(), value);
        Ok(Value::sym(format!("#'{}/{}", ctx.ns, name)))
    }

    fn eval_if(&self, ctx: &mut EvalContext<'_>, args: &[Value]) -> Result<Value, EvalError> {
        let Some(cond) = args.first() else {
            return Err(EvalError::new("if expects a condition"));
        };
        if truthy(&self.eval_form(ctx, cond)?) {
            match args.get(1) {
                Some(branch) => self.eval_form(ctx, branch),
                None => Ok(Value::Nil),
            }
        } else {
            match args.get(2) {
                Some(branch) => self.eval_form(ctx, branch),
                None => Ok(Value::Nil),
            }
        }
    }

    fn eval_do(&self, ctx: &mut EvalContext<'_>, args: &[Value]) -> Result<Value, EvalError> {
        let mut last = Value::Nil;
        for form in args {
            last = self.eval_form(ctx, form)?;
        }
        Ok(last)
    }

    fn eval_in_ns(&self, ctx: &mut EvalContext<'_>, args: &[Value]) -> Result<Value, EvalError> {
        let name = match args {
            [form] => match self.eval_form(ctx, form)? {
                Value::Sym(s) | Value::Str(s) => s,
                other => {
                    return Err(EvalError::new(format!(
                        "in-ns expects a namespace name, got {other}"
                    )));
                }
            },
            _ => return Err(EvalError::new("in-ns expects exactly one namespace name")),
        };
        self.namespaces.lock().unwrap().entry(name.clone()).or_default();
        ctx.ns = name.clone();
        Ok(Value::sym(name))
    }

    fn eval_loop(&self, ctx: &mut EvalContext<'_>, body: &[Value]) -> Result<Value, EvalError> {
        loop {
            if ctx.interrupt.load(Ordering::Acquire) {
                return Err(EvalError::interrupt());
            }
            for form in body {
                self.eval_form(ctx, form)?;
            }
        }
    }

    fn apply(
        &self,
        ctx: &mut EvalContext<'_>,
        op: &str,
        args: Vec<Value>,
    ) -> Result<Value, EvalError> {
        match op {
            "+" => {
                let mut acc = 0i64;
                for n in int_args(op, &args)? {
                    acc = acc
                        .checked_add(n)
                        .ok_or_else(|| EvalError::new("integer overflow in '+'"))?;
                }
                Ok(Value::Int(acc))
            }
            "-" => {
                let ints = int_args(op, &args)?;
                match ints.split_first() {
                    None => Err(EvalError::new("'-' expects at least one argument")),
                    Some((first, [])) => Ok(Value::Int(-first)),
                    Some((first, rest)) => {
                        let mut acc = *first;
                        for n in rest {
                            acc = acc
                                .checked_sub(*n)
                                .ok_or_else(|| EvalError::new("integer overflow in '-'"))?;
                        }
                        Ok(Value::Int(acc))
                    }
                }
            }
            "*" => {
                let mut acc = 1i64;
                for n in int_args(op, &args)? {
                    acc = acc
                        .checked_mul(n)
                        .ok_or_else(|| EvalError::new("integer overflow in '*'"))?;
                }
                Ok(Value::Int(acc))
            }
            "/" => {
                let ints = int_args(op, &args)?;
                let Some((first, rest)) = ints.split_first() else {
                    return Err(EvalError::new("'/' expects at least one argument"));
                };
                if rest.is_empty() {
                    return Err(EvalError::new("'/' expects a divisor"));
                }
                let mut acc = *first;
                for n in rest {
                    if *n == 0 {
                        return Err(EvalError::new("divide by zero"));
                    }
                    acc = acc
                        .checked_div(*n)
                        .ok_or_else(|| EvalError::new("integer overflow in '/'"))?;
                }
                Ok(Value::Int(acc))
            }
            "=" => Ok(Value::Bool(args.windows(2).all(|w| w[0] == w[1]))),
            "<" => {
                let ints = int_args(op, &args)?;
                Ok(Value::Bool(ints.windows(2).all(|w| w[0] < w[1])))
            }
            ">" => {
                let ints = int_args(op, &args)?;
                Ok(Value::Bool(ints.windows(2).all(|w| w[0] > w[1])))
            }
            "str" => {
                let mut out = String::new();
                for arg in &args {
                    match arg {
                        Value::Nil => {}
                        Value::Str(s) => out.push_str(s),
                        other => out.push_str(&other.to_string()),
                    }
                }
                Ok(Value::str(out))
            }
            "list" => Ok(Value::List(args)),
            "count" => match args.as_slice() {
                [Value::List(items)] => Ok(Value::Int(items.len() as i64)),
                [Value::Map(entries)] => Ok(Value::Int(entries.len() as i64)),
                [Value::Str(s)] => Ok(Value::Int(s.chars().count() as i64)),
                [Value::Nil] => Ok(Value::Int(0)),
                _ => Err(EvalError::new("count expects one countable argument")),
            },
            "print" => {
                ctx.out.append(&human_join(&args));
                Ok(Value::Nil)
            }
            "println" => {
                let mut text = human_join(&args);
                text.push('\n');
                ctx.out.append(&text);
                Ok(Value::Nil)
            }
            "read-line" => match ctx.stdin.read_line() {
                Some(line) => Ok(Value::str(line)),
                None => Ok(Value::Nil),
            },
            "sleep" => {
                let ints = int_args(op, &args)?;
                let [ms] = ints.as_slice() else {
                    return Err(EvalError::new("sleep expects a millisecond count"));
                };
                let deadline =
                    time::Instant::now() + time::Duration::from_millis((*ms).max(0) as u64);
                loop {
                    if ctx.interrupt.load(Ordering::Acquire) {
                        return Err(EvalError::interrupt());
                    }
                    let now = time::Instant::now();
                    if now >= deadline {
                        return Ok(Value::Nil);
                    }
                    thread::sleep(cmp::min(deadline - now, INTERRUPT_POLL));
                }
            }
            "interrupt-eval" => {
                let id = match args.as_slice() {
                    [Value::Str(id)] => id,
                    _ => return Err(EvalError::new("interrupt-eval expects a request id string")),
                };
                let control = ctx
                    .control
                    .ok_or_else(|| EvalError::new("no server control surface in this context"))?;
                Ok(Value::Bool(control.interrupt_eval(id)))
            }
            "deliver-server-port" => {
                let port = match args.as_slice() {
                    [Value::Int(p)] if (0..=i64::from(u16::MAX)).contains(p) => *p as u16,
                    _ => return Err(EvalError::new("deliver-server-port expects a port number")),
                };
                let control = ctx
                    .control
                    .ok_or_else(|| EvalError::new("no server control surface in this context"))?;
                control.deliver_server_port(port);
                Ok(Value::Bool(true))
            }
            "retain-session" => {
                let control = ctx
                    .control
                    .ok_or_else(|| EvalError::new("no server control surface in this context"))?;
                Ok(Value::str(control.retain_session()))
            }
            "release-session" => {
                let control = ctx
                    .control
                    .ok_or_else(|| EvalError::new("no server control surface in this context"))?;
                Ok(Value::Bool(control.release_session()))
            }
            _ => {
                if self.lookup_var(&ctx.ns, op).is_some() {
                    Err(EvalError::new(format!("'{op}' is not a function")))
                } else {
                    Err(EvalError::new(format!(
                        "unable to resolve symbol '{op}' in namespace '{}'",
                        ctx.ns
                    )))
                }
            }
        }
    }
}

impl Default for LispRuntime {
    fn default() -> Self {
        LispRuntime::new()
    }
}

impl Runtime for LispRuntime {
    fn read_form<'s>(&self, src: &'s str) -> Result<Option<(Value, &'s str)>, EvalError> {
        match read_from_str(src) {
            Ok(Some((form, used))) => Ok(Some((form, &src[used..]))),
            Ok(None) => Ok(None),
            Err(e) => Err(EvalError::with_cause("unreadable form", e.to_string())),
        }
    }

    fn eval(&self, ctx: &mut EvalContext<'_>, form: &Value) -> Result<Value, EvalError> {
        self.eval_form(ctx, form)
    }

    fn print(&self, prefs: &PrinterPrefs, value: &Value) -> String {
        let mut out = String::new();
        render_limited(value, prefs, 1, &mut out);
        out
    }

    fn pretty_print(&self, prefs: &PrinterPrefs, value: &Value) -> Option<String> {
        let mut out = String::new();
        render_pretty(value, prefs, 1, 0, &mut out);
        Some(out)
    }

    fn format_trace(&self, err: &EvalError, detail: bool) -> String {
        if !detail || err.causes.is_empty() {
            return err.message.clone();
        }
        let mut out = err.message.clone();
        for cause in &err.causes {
            out.push_str("\ncaused by: ");
            out.push_str(cause);
        }
        out
    }
}

fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Nil | Value::Bool(false))
}

fn int_args(op: &str, args: &[Value]) -> Result<Vec<i64>, EvalError> {
    args.iter()
        .map(|arg| {
            arg.as_int()
                .ok_or_else(|| EvalError::new(format!("'{op}' expects integers, got {arg}")))
        })
        .collect()
}

/// Space-joined human form for `print`: strings print raw, everything
/// else prints readably.
fn human_join(args: &[Value]) -> String {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        match arg {
            Value::Str(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
    }
    out
}

/// The readable printer, honoring print-length and print-level.
fn render_limited(value: &Value, prefs: &PrinterPrefs, depth: i64, out: &mut String) {
    match value {
        Value::List(items) => {
            if past_level(prefs, depth) {
                out.push('#');
                return;
            }
            out.push('(');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                if past_length(prefs, i) {
                    out.push_str("...");
                    break;
                }
                render_limited(item, prefs, depth + 1, out);
            }
            out.push(')');
        }
        Value::Map(entries) => {
            if past_level(prefs, depth) {
                out.push('#');
                return;
            }
            out.push('{');
            for (i, (k, v)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                if past_length(prefs, i) {
                    out.push_str("...");
                    break;
                }
                out.push_str(&key_token(k));
                out.push(' ');
                render_limited(v, prefs, depth + 1, out);
            }
            out.push('}');
        }
        atom => out.push_str(&atom.to_string()),
    }
}

/// The pretty printer: values whose flat form is short print flat,
/// everything else breaks collection items across indented lines.
fn render_pretty(value: &Value, prefs: &PrinterPrefs, depth: i64, indent: usize, out: &mut String) {
    let mut flat = String::new();
    render_limited(value, prefs, depth, &mut flat);
    if flat.len() <= PRETTY_WIDTH {
        out.push_str(&flat);
        return;
    }
    match value {
        Value::List(items) => {
            out.push('(');
            for (i, item) in items.iter().enumerate() {
                if past_length(prefs, i) {
                    push_break(out, indent + 1);
                    out.push_str("...");
                    break;
                }
                if i > 0 {
                    push_break(out, indent + 1);
                }
                render_pretty(item, prefs, depth + 1, indent + 1, out);
            }
            out.push(')');
        }
        Value::Map(entries) => {
            out.push('{');
            for (i, (k, v)) in entries.iter().enumerate() {
                if past_length(prefs, i) {
                    push_break(out, indent + 1);
                    out.push_str("...");
                    break;
                }
                if i > 0 {
                    push_break(out, indent + 1);
                }
                out.push_str(&key_token(k));
                out.push(' ');
                render_pretty(v, prefs, depth + 1, indent + 1 + k.len() + 1, out);
            }
            out.push('}');
        }
        atom => out.push_str(&atom.to_string()),
    }
}

fn push_break(out: &mut String, indent: usize) {
    out.push('\n');
    for _ in 0..indent {
        out.push(' ');
    }
}

fn past_level(prefs: &PrinterPrefs, depth: i64) -> bool {
    prefs.print_level.map(|level| depth > level).unwrap_or(false)
}

fn past_length(prefs: &PrinterPrefs, index: usize) -> bool {
    prefs.print_length.map(|len| index as i64 >= len).unwrap_or(false)
}
