//! Device eligibility predicates.
//!
//! Users select which serial device to bridge with a small expression over
//! the fields of a [`DeviceDescriptor`], e.g.
//!
//! ```text
//! d.usb_vid == 0x2e8a and 'Pico' in d.usb_description
//! usb_manufacturer =~ '(?i)arduino' or usb_vid in [0x2341, 0x1b4f]
//! ```
//!
//! Expressions are compiled once at startup; syntax errors and unknown field
//! names are reported then. At match time any evaluation error (an absent
//! field used in a comparison, mismatched types) makes the device ineligible
//! rather than aborting discovery.

use std::{cmp::Ordering, fmt, str::FromStr, sync::Arc};

use crate::{
    device::DeviceDescriptor,
    error::{Error, Result},
    tracing::prelude::*,
};

pub mod parse;

use parse::{CmpOp, Expr, Operand};

/// Descriptor fields an expression may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    DevicePath,
    UsbDescription,
    UsbVid,
    UsbPid,
    UsbManufacturer,
}

impl Field {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "device_path" => Ok(Self::DevicePath),
            "usb_description" => Ok(Self::UsbDescription),
            "usb_vid" => Ok(Self::UsbVid),
            "usb_pid" => Ok(Self::UsbPid),
            "usb_manufacturer" => Ok(Self::UsbManufacturer),
            _ => Err(Error::Predicate(format!("unknown field '{}'", name))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::DevicePath => "device_path",
            Self::UsbDescription => "usb_description",
            Self::UsbVid => "usb_vid",
            Self::UsbPid => "usb_pid",
            Self::UsbManufacturer => "usb_manufacturer",
        }
    }

    fn value(&self, device: &DeviceDescriptor) -> Value {
        fn text(value: &Option<String>) -> Value {
            value.clone().map_or(Value::None, Value::Str)
        }
        fn id(value: Option<u16>) -> Value {
            value.map_or(Value::None, |v| Value::Int(v.into()))
        }

        match self {
            Self::DevicePath => Value::Str(device.device_path.clone()),
            Self::UsbDescription => text(&device.usb_description),
            Self::UsbVid => id(device.usb_vid),
            Self::UsbPid => id(device.usb_pid),
            Self::UsbManufacturer => text(&device.usb_manufacturer),
        }
    }
}

/// Runtime value of an operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<Value>),
    None,
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Value::Str(s) => !s.is_empty(),
            Value::Int(n) => *n != 0,
            Value::Bool(b) => *b,
            Value::List(items) => !items.is_empty(),
            Value::None => false,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Int(_) => "integer",
            Value::Bool(_) => "bool",
            Value::List(_) => "list",
            Value::None => "None",
        }
    }
}

/// Compiled device predicate. The default matcher accepts every device.
#[derive(Clone, Default)]
pub struct Matcher {
    source: Option<Arc<str>>,
    expr: Option<Arc<Expr>>,
}

impl Matcher {
    /// A matcher that accepts every device.
    pub fn any() -> Self {
        Self::default()
    }

    /// Compile an expression. A blank expression matches everything.
    pub fn compile(source: &str) -> Result<Self> {
        if source.trim().is_empty() {
            return Ok(Self::any());
        }
        let expr = parse::parse(source)?;
        Ok(Self {
            source: Some(source.into()),
            expr: Some(Arc::new(expr)),
        })
    }

    /// The expression text, if any.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Evaluate against `device`, reporting evaluation failures.
    pub fn evaluate(&self, device: &DeviceDescriptor) -> Result<bool> {
        match &self.expr {
            None => Ok(true),
            Some(expr) => eval(expr, device),
        }
    }

    /// Whether `device` is eligible. Evaluation failures count as no match.
    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        match self.evaluate(device) {
            Ok(matched) => matched,
            Err(e) => {
                debug!(
                    device = %device.device_path,
                    error = %e,
                    "Match expression failed; treating device as ineligible"
                );
                false
            }
        }
    }
}

impl FromStr for Matcher {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::compile(s)
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source() {
            Some(source) => write!(f, "Matcher({:?})", source),
            None => write!(f, "Matcher(*)"),
        }
    }
}

fn eval(expr: &Expr, device: &DeviceDescriptor) -> Result<bool> {
    match expr {
        // Both sides always run so an absent field excludes the device
        // wherever it appears.
        Expr::Or(lhs, rhs) => {
            let (lhs, rhs) = (eval(lhs, device)?, eval(rhs, device)?);
            Ok(lhs || rhs)
        }
        Expr::And(lhs, rhs) => {
            let (lhs, rhs) = (eval(lhs, device)?, eval(rhs, device)?);
            Ok(lhs && rhs)
        }
        Expr::Not(inner) => Ok(!eval(inner, device)?),
        Expr::Truthy(operand) => Ok(resolve(operand, device).truthy()),
        Expr::Compare { op, lhs, rhs } => compare(*op, lhs, rhs, device),
        Expr::Contains {
            needle,
            haystack,
            negated,
        } => {
            let needle = present(needle, device)?;
            let haystack = present(haystack, device)?;
            let found = match (&needle, &haystack) {
                (Value::Str(n), Value::Str(h)) => h.contains(n.as_str()),
                (_, Value::List(items)) => items.contains(&needle),
                _ => return Err(type_error("in", &needle, &haystack)),
            };
            Ok(found != *negated)
        }
        Expr::Matches { operand, regex } => match present(operand, device)? {
            Value::Str(text) => Ok(regex.is_match(&text)),
            other => Err(Error::Predicate(format!(
                "'=~' needs a string, got {}",
                other.kind()
            ))),
        },
    }
}

fn resolve(operand: &Operand, device: &DeviceDescriptor) -> Value {
    match operand {
        Operand::Field(field) => field.value(device),
        Operand::Literal(value) => value.clone(),
    }
}

// Resolve an operand that must hold a value; absent fields are errors.
fn present(operand: &Operand, device: &DeviceDescriptor) -> Result<Value> {
    match (operand, resolve(operand, device)) {
        (Operand::Field(field), Value::None) => Err(Error::Predicate(format!(
            "field '{}' is absent",
            field.name()
        ))),
        (_, value) => Ok(value),
    }
}

fn compare(op: CmpOp, lhs: &Operand, rhs: &Operand, device: &DeviceDescriptor) -> Result<bool> {
    let is_none_literal = |o: &Operand| matches!(o, Operand::Literal(Value::None));

    // Explicit tests for absence, e.g. `usb_manufacturer == None`.
    if is_none_literal(lhs) || is_none_literal(rhs) {
        let equal = resolve(lhs, device) == resolve(rhs, device);
        return match op {
            CmpOp::Eq => Ok(equal),
            CmpOp::Ne => Ok(!equal),
            _ => Err(Error::Predicate("None cannot be ordered".into())),
        };
    }

    let lhs = present(lhs, device)?;
    let rhs = present(rhs, device)?;
    let ordering = match (&lhs, &rhs) {
        (Value::Str(a), Value::Str(b)) => a.cmp(b),
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) if matches!(op, CmpOp::Eq | CmpOp::Ne) => a.cmp(b),
        _ => return Err(type_error(op_symbol(op), &lhs, &rhs)),
    };

    Ok(match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
    })
}

fn op_symbol(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "==",
        CmpOp::Ne => "!=",
        CmpOp::Lt => "<",
        CmpOp::Le => "<=",
        CmpOp::Gt => ">",
        CmpOp::Ge => ">=",
    }
}

fn type_error(op: &str, lhs: &Value, rhs: &Value) -> Error {
    Error::Predicate(format!(
        "'{}' not supported between {} and {}",
        op,
        lhs.kind(),
        rhs.kind()
    ))
}
