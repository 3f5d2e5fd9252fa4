//! Grammar for match expressions.
//!
//! Lowest precedence first:
//!
//! ```text
//! expr       := and_expr (("or" | "||") and_expr)*
//! and_expr   := not_expr (("and" | "&&") not_expr)*
//! not_expr   := ("not" | "!") not_expr | comparison
//! comparison := "(" expr ")"
//!             | operand (cmp_op operand | "in" operand | "not" "in" operand
//!                        | "=~" STRING)?
//! operand    := "d." field | literal | field
//! literal    := STRING | INT | "True" | "False" | "None" | "[" literal,* "]"
//! ```

use regex::Regex;

use super::{Field, Value};
use crate::error::{Error, Result};

/// Deepest nesting of parentheses, brackets, and negations accepted.
pub const MAX_NESTING: usize = 32;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Leaf of a comparison.
#[derive(Debug, Clone)]
pub enum Operand {
    Field(Field),
    Literal(Value),
}

/// Parsed expression tree.
#[derive(Debug, Clone)]
pub enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare {
        op: CmpOp,
        lhs: Operand,
        rhs: Operand,
    },
    Contains {
        needle: Operand,
        haystack: Operand,
        negated: bool,
    },
    Matches {
        operand: Operand,
        regex: Regex,
    },
    Truthy(Operand),
}

/// Parse `source` into an expression tree.
pub fn parse(source: &str) -> Result<Expr> {
    let depth = nesting(source);
    if depth > MAX_NESTING {
        return Err(Error::Predicate(format!(
            "expression nests {} levels deep, limit is {}",
            depth, MAX_NESTING
        )));
    }
    predicate::expr(source).map_err(|e| {
        Error::Predicate(format!("syntax error at {}: expected {}", e.location, e.expected))
    })
}

// Upper bound on how deep the grammar recurses for `source`: open groups plus
// every prefix negation, ignoring string contents.
fn nesting(source: &str) -> usize {
    let mut depth = 0usize;
    let mut deepest = 0usize;
    let mut negations = 0usize;
    let mut quote = None;
    let mut chars = source.chars().peekable();
    let mut word = String::new();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            match c {
                '\\' => {
                    chars.next();
                }
                c if c == q => quote = None,
                _ => {}
            }
            continue;
        }

        if c.is_alphanumeric() || c == '_' {
            word.push(c);
            continue;
        }
        if word == "not" {
            negations += 1;
        }
        word.clear();

        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' => {
                depth += 1;
                deepest = deepest.max(depth);
            }
            ')' | ']' => depth = depth.saturating_sub(1),
            '!' if chars.peek() != Some(&'=') => negations += 1,
            _ => {}
        }
    }
    if word == "not" {
        negations += 1;
    }

    deepest + negations
}

fn int_value(digits: &str, radix: u32) -> std::result::Result<i64, &'static str> {
    i64::from_str_radix(&digits.replace('_', ""), radix).map_err(|_| "integer in range")
}

peg::parser! {
    grammar predicate() for str {
        use super::{int_value, CmpOp, Expr, Field, Operand, Regex, Value};

        rule _() = quiet!{ [' ' | '\t' | '\r' | '\n']* }

        rule ident_char() = ['a'..='z' | 'A'..='Z' | '0'..='9' | '_']

        rule ident() -> &'input str
            = quiet!{ $( ['a'..='z' | 'A'..='Z' | '_'] ident_char()* ) }
              / expected!("field name")

        rule or_op() = "or" !ident_char() / "||"
        rule and_op() = "and" !ident_char() / "&&"
        rule not_word() = "not" !ident_char()
        rule not_op() = not_word() / "!" !"="
        rule in_op() = "in" !ident_char()

        pub rule expr() -> Expr
            = _ e:or_expr() _ { e }

        rule or_expr() -> Expr
            = first:and_expr() rest:(_ or_op() _ e:and_expr() { e })* {
                rest.into_iter().fold(first, |lhs, rhs| Expr::Or(Box::new(lhs), Box::new(rhs)))
            }

        rule and_expr() -> Expr
            = first:not_expr() rest:(_ and_op() _ e:not_expr() { e })* {
                rest.into_iter().fold(first, |lhs, rhs| Expr::And(Box::new(lhs), Box::new(rhs)))
            }

        rule not_expr() -> Expr
            = not_op() _ e:not_expr() { Expr::Not(Box::new(e)) }
            / comparison()

        rule comparison() -> Expr
            = "(" _ e:or_expr() _ ")" { e }
            / lhs:operand() _ op:cmp_op() _ rhs:operand() { Expr::Compare { op, lhs, rhs } }
            / needle:operand() _ in_op() _ haystack:operand() {
                Expr::Contains { needle, haystack, negated: false }
            }
            / needle:operand() _ not_word() _ in_op() _ haystack:operand() {
                Expr::Contains { needle, haystack, negated: true }
            }
            / operand:operand() _ "=~" _ pattern:string() {?
                Regex::new(&pattern)
                    .map(|regex| Expr::Matches { operand, regex })
                    .map_err(|_| "valid regular expression")
            }
            / operand:operand() { Expr::Truthy(operand) }

        rule cmp_op() -> CmpOp
            = "==" { CmpOp::Eq }
            / "!=" { CmpOp::Ne }
            / "<=" { CmpOp::Le }
            / ">=" { CmpOp::Ge }
            / "<" { CmpOp::Lt }
            / ">" { CmpOp::Gt }

        rule operand() -> Operand
            = "d" _ "." _ f:field() { Operand::Field(f) }
            / v:literal() { Operand::Literal(v) }
            / f:field() { Operand::Field(f) }

        rule field() -> Field
            = name:ident() {? Field::from_name(name).map_err(|_| "known field name") }

        rule literal() -> Value
            = s:string() { Value::Str(s) }
            / n:int() { Value::Int(n) }
            / ("True" / "true") !ident_char() { Value::Bool(true) }
            / ("False" / "false") !ident_char() { Value::Bool(false) }
            / ("None" / "null") !ident_char() { Value::None }
            / "[" _ items:(literal() ** (_ "," _)) _ "]" { Value::List(items) }

        rule int() -> i64
            = quiet!{
                "0" ['x' | 'X'] digits:$(['0'..='9' | 'a'..='f' | 'A'..='F' | '_']+) !ident_char() {?
                    int_value(digits, 16)
                }
                / digits:$(['0'..='9'] ['0'..='9' | '_']*) !ident_char() {? int_value(digits, 10) }
            }
            / expected!("integer")

        rule string() -> String
            = "'" chars:(single_quoted()*) "'" { chars.into_iter().collect() }
            / "\"" chars:(double_quoted()*) "\"" { chars.into_iter().collect() }

        rule single_quoted() -> char
            = "\\" c:[_] { c }
            / c:[^ '\'' | '\\'] { c }

        rule double_quoted() -> char
            = "\\" c:[_] { c }
            / c:[^ '"' | '\\'] { c }
    }
}
