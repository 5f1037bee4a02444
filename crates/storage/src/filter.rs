//! Filter predicates over stored tables.
//!
//! Grammar (keywords are case-insensitive):
//!
//! ```text
//! expr    := and (OR and)*
//! and     := unary (AND unary)*
//! unary   := NOT unary | '(' expr ')' | column test
//! test    := IS [NOT] NULL | [NOT] IN '(' literal (',' literal)* ')' | op literal
//! op      := = | == | != | <> | < | <= | > | >=
//! literal := 'string' | number | TRUE | FALSE | NULL
//! ```
//!
//! Column names may be bare identifiers or quoted with `"` or backticks.
//! Evaluation compiles to arrow comparison and boolean kernels; a null
//! comparison result counts as "no match".

use std::fmt;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, Int64Array, Scalar, StringArray};
use arrow::compute::kernels::boolean::{and_kleene, is_not_null, is_null, not, or_kleene};
use arrow::compute::kernels::cast::cast;
use arrow::compute::kernels::cmp::{eq, gt, gt_eq, lt, lt_eq, neq};
use arrow::record_batch::RecordBatch;
use arrow_schema::DataType;
use vq_common::{Result, VqError};

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CmpOp {
    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::NotEq => "!=",
            CmpOp::Lt => "<",
            CmpOp::LtEq => "<=",
            CmpOp::Gt => ">",
            CmpOp::GtEq => ">=",
        }
    }
}

/// Literal operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(v) => write!(f, "{v}"),
            Literal::Float(v) => write!(f, "{v}"),
            Literal::Str(v) => write!(f, "'{}'", v.replace('\'', "''")),
            Literal::Bool(v) => write!(f, "{}", if *v { "TRUE" } else { "FALSE" }),
            Literal::Null => write!(f, "NULL"),
        }
    }
}

/// Parsed predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        column: String,
        op: CmpOp,
        value: Literal,
    },
    IsNull {
        column: String,
        negated: bool,
    },
    InList {
        column: String,
        values: Vec<Literal>,
        negated: bool,
    },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Compare { column, op, value } => {
                write!(f, "{column} {} {value}", op.symbol())
            }
            Predicate::IsNull { column, negated } => {
                write!(f, "{column} IS {}NULL", if *negated { "NOT " } else { "" })
            }
            Predicate::InList {
                column,
                values,
                negated,
            } => {
                let items = values.iter().map(|v| v.to_string()).collect::<Vec<_>>();
                write!(
                    f,
                    "{column} {}IN ({})",
                    if *negated { "NOT " } else { "" },
                    items.join(", ")
                )
            }
            Predicate::And(a, b) => write!(f, "({a} AND {b})"),
            Predicate::Or(a, b) => write!(f, "({a} OR {b})"),
            Predicate::Not(p) => write!(f, "NOT {p}"),
        }
    }
}

impl Predicate {
    /// Parse a predicate string.
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let predicate = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(invalid(format!("unexpected token {tok:?} in filter '{input}'")));
        }
        Ok(predicate)
    }

    /// Evaluate against every row of `batch`; nulls are folded to `false`.
    pub fn evaluate(&self, batch: &RecordBatch) -> Result<BooleanArray> {
        let mask = self.eval(batch)?;
        if mask.null_count() == 0 {
            return Ok(mask);
        }
        Ok(mask.iter().map(|v| Some(v.unwrap_or(false))).collect())
    }

    fn eval(&self, batch: &RecordBatch) -> Result<BooleanArray> {
        match self {
            Predicate::Compare { column, op, value } => {
                compare(column_of(batch, column)?, *op, value, column)
            }
            Predicate::IsNull { column, negated } => {
                let array = column_of(batch, column)?;
                Ok(if *negated {
                    is_not_null(array.as_ref())?
                } else {
                    is_null(array.as_ref())?
                })
            }
            Predicate::InList {
                column,
                values,
                negated,
            } => {
                let array = column_of(batch, column)?;
                let mut acc = BooleanArray::from(vec![false; batch.num_rows()]);
                for value in values {
                    let hit = compare(array.clone(), CmpOp::Eq, value, column)?;
                    acc = or_kleene(&acc, &hit)?;
                }
                Ok(if *negated { not(&acc)? } else { acc })
            }
            Predicate::And(a, b) => Ok(and_kleene(&a.eval(batch)?, &b.eval(batch)?)?),
            Predicate::Or(a, b) => Ok(or_kleene(&a.eval(batch)?, &b.eval(batch)?)?),
            Predicate::Not(p) => Ok(not(&p.eval(batch)?)?),
        }
    }

    /// Columns the predicate reads.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::Compare { column, .. }
            | Predicate::IsNull { column, .. }
            | Predicate::InList { column, .. } => {
                if !out.contains(&column.as_str()) {
                    out.push(column);
                }
            }
            Predicate::And(a, b) | Predicate::Or(a, b) => {
                a.collect_columns(out);
                b.collect_columns(out);
            }
            Predicate::Not(p) => p.collect_columns(out),
        }
    }
}

fn invalid(msg: String) -> VqError {
    VqError::InvalidInput(msg)
}

fn column_of(batch: &RecordBatch, name: &str) -> Result<ArrayRef> {
    batch
        .column_by_name(name)
        .cloned()
        .ok_or_else(|| VqError::MissingColumn(format!("filter references unknown column '{name}'")))
}

fn is_integer(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
    )
}

fn is_numeric(dt: &DataType) -> bool {
    is_integer(dt)
        || matches!(
            dt,
            DataType::Float16 | DataType::Float32 | DataType::Float64 | DataType::Decimal128(_, _)
        )
}

fn compare(array: ArrayRef, op: CmpOp, value: &Literal, column: &str) -> Result<BooleanArray> {
    let dt = array.data_type().clone();
    let (lhs, rhs): (ArrayRef, ArrayRef) = match value {
        Literal::Null => return Ok(BooleanArray::new_null(array.len())),
        Literal::Int(v) if is_integer(&dt) => {
            (cast(&array, &DataType::Int64)?, Arc::new(Int64Array::from(vec![*v])))
        }
        Literal::Int(v) if is_numeric(&dt) => (
            cast(&array, &DataType::Float64)?,
            Arc::new(Float64Array::from(vec![*v as f64])),
        ),
        Literal::Float(v) if is_numeric(&dt) => (
            cast(&array, &DataType::Float64)?,
            Arc::new(Float64Array::from(vec![*v])),
        ),
        Literal::Str(v) if matches!(dt, DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View) => (
            cast(&array, &DataType::Utf8)?,
            Arc::new(StringArray::from(vec![v.as_str()])),
        ),
        Literal::Bool(v) if dt == DataType::Boolean => {
            (array, Arc::new(BooleanArray::from(vec![*v])))
        }
        other => {
            return Err(invalid(format!(
                "cannot compare column '{column}' of type {dt} with {other}"
            )));
        }
    };
    let rhs = Scalar::new(rhs);
    let out = match op {
        CmpOp::Eq => eq(&lhs, &rhs),
        CmpOp::NotEq => neq(&lhs, &rhs),
        CmpOp::Lt => lt(&lhs, &rhs),
        CmpOp::LtEq => lt_eq(&lhs, &rhs),
        CmpOp::Gt => gt(&lhs, &rhs),
        CmpOp::GtEq => gt_eq(&lhs, &rhs),
    }?;
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(String),
    Op(CmpOp),
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars = input.chars().collect::<Vec<_>>();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                out.push(Token::LParen);
                i += 1;
            }
            ')' => {
                out.push(Token::RParen);
                i += 1;
            }
            ',' => {
                out.push(Token::Comma);
                i += 1;
            }
            '\'' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            s.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                        None => return Err(invalid(format!("unterminated string in filter '{input}'"))),
                    }
                }
                out.push(Token::Str(s));
            }
            '"' | '`' => {
                let close = c;
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|ch| *ch == close)
                    .map(|p| start + p)
                    .ok_or_else(|| invalid(format!("unterminated identifier in filter '{input}'")))?;
                out.push(Token::Ident(chars[start..end].iter().collect()));
                i = end + 1;
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (op, width) = match (c, next) {
                    ('=', Some('=')) => (CmpOp::Eq, 2),
                    ('=', _) => (CmpOp::Eq, 1),
                    ('!', Some('=')) => (CmpOp::NotEq, 2),
                    ('<', Some('>')) => (CmpOp::NotEq, 2),
                    ('<', Some('=')) => (CmpOp::LtEq, 2),
                    ('<', _) => (CmpOp::Lt, 1),
                    ('>', Some('=')) => (CmpOp::GtEq, 2),
                    ('>', _) => (CmpOp::Gt, 1),
                    _ => return Err(invalid(format!("unexpected '{c}' in filter '{input}'"))),
                };
                out.push(Token::Op(op));
                i += width;
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || matches!(chars[i], '.' | 'e' | 'E'))
                {
                    i += 1;
                }
                out.push(Token::Number(chars[start..i].iter().collect()));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                out.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(invalid(format!("unexpected '{other}' in filter '{input}'"))),
        }
    }
    Ok(out)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn keyword(&mut self, kw: &str) -> bool {
        match self.peek() {
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case(kw) => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(tok) if tok == expected => Ok(()),
            other => Err(invalid(format!("expected {expected:?}, found {other:?}"))),
        }
    }

    fn parse_or(&mut self) -> Result<Predicate> {
        let mut left = self.parse_and()?;
        while self.keyword("OR") {
            let right = self.parse_and()?;
            left = Predicate::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Predicate> {
        let mut left = self.parse_unary()?;
        while self.keyword("AND") {
            let right = self.parse_unary()?;
            left = Predicate::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Predicate> {
        if self.keyword("NOT") {
            return Ok(Predicate::Not(Box::new(self.parse_unary()?)));
        }
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            self.expect(Token::RParen)?;
            return Ok(inner);
        }
        let column = match self.next() {
            Some(Token::Ident(name)) => name,
            other => return Err(invalid(format!("expected column name, found {other:?}"))),
        };
        self.parse_test(column)
    }

    fn parse_test(&mut self, column: String) -> Result<Predicate> {
        if self.keyword("IS") {
            let negated = self.keyword("NOT");
            if !self.keyword("NULL") {
                return Err(invalid(format!("expected NULL after IS on column '{column}'")));
            }
            return Ok(Predicate::IsNull { column, negated });
        }
        let negated = self.keyword("NOT");
        if self.keyword("IN") {
            self.expect(Token::LParen)?;
            let mut values = vec![self.parse_literal()?];
            while self.peek() == Some(&Token::Comma) {
                self.pos += 1;
                values.push(self.parse_literal()?);
            }
            self.expect(Token::RParen)?;
            return Ok(Predicate::InList {
                column,
                values,
                negated,
            });
        }
        if negated {
            return Err(invalid(format!("expected IN after NOT on column '{column}'")));
        }
        match self.next() {
            Some(Token::Op(op)) => Ok(Predicate::Compare {
                column,
                op,
                value: self.parse_literal()?,
            }),
            other => Err(invalid(format!(
                "expected comparison after column '{column}', found {other:?}"
            ))),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Literal::Str(s)),
            Some(Token::Number(n)) => {
                if let Ok(v) = n.parse::<i64>() {
                    Ok(Literal::Int(v))
                } else {
                    n.parse::<f64>()
                        .map(Literal::Float)
                        .map_err(|_| invalid(format!("invalid number '{n}'")))
                }
            }
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("TRUE") => Ok(Literal::Bool(true)),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("FALSE") => {
                Ok(Literal::Bool(false))
            }
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("NULL") => Ok(Literal::Null),
            other => Err(invalid(format!("expected literal, found {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Float32Array, Int64Array, StringArray};
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};
    use vq_common::VqError;

    use super::{CmpOp, Literal, Predicate};

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("score", DataType::Float32, true),
            Field::new("tag", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3, 4])),
                Arc::new(Float32Array::from(vec![Some(0.5), None, Some(2.5), Some(1.0)])),
                Arc::new(StringArray::from(vec![Some("a"), Some("b"), None, Some("it's")])),
            ],
        )
        .expect("batch")
    }

    fn mask_of(filter: &str) -> Vec<bool> {
        Predicate::parse(filter)
            .expect("parse")
            .evaluate(&batch())
            .expect("evaluate")
            .iter()
            .map(|v| v.expect("non-null"))
            .collect()
    }

    #[test]
    fn parses_precedence_and_parentheses() {
        let p = Predicate::parse("id > 1 AND (tag = 'a' OR NOT score < 1)").expect("parse");
        assert!(matches!(p, Predicate::And(_, _)));
        assert_eq!(p.columns(), vec!["id", "tag", "score"]);
        let p = Predicate::parse("id = 3").expect("parse");
        assert_eq!(
            p,
            Predicate::Compare {
                column: "id".to_string(),
                op: CmpOp::Eq,
                value: Literal::Int(3)
            }
        );
    }

    #[test]
    fn evaluates_comparisons_nulls_and_lists() {
        assert_eq!(mask_of("id >= 3"), vec![false, false, true, true]);
        assert_eq!(mask_of("score > 0.9"), vec![false, false, true, true]);
        assert_eq!(mask_of("tag IS NULL"), vec![false, false, true, false]);
        assert_eq!(mask_of("tag is not null and id <> 1"), vec![false, true, false, true]);
        assert_eq!(mask_of("id IN (1, 4)"), vec![true, false, false, true]);
        assert_eq!(mask_of("id NOT IN (1, 4)"), vec![false, true, true, false]);
        assert_eq!(mask_of("tag = 'it''s'"), vec![false, false, false, true]);
        assert_eq!(mask_of("NOT (score < 1)"), vec![false, false, true, true]);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(Predicate::parse("id >").is_err());
        assert!(Predicate::parse("id = 1 junk").is_err());
        let err = Predicate::parse("missing = 1")
            .expect("parse")
            .evaluate(&batch())
            .expect_err("unknown column");
        assert!(matches!(err, VqError::MissingColumn(_)));
        assert!(Predicate::parse("tag > 3").expect("parse").evaluate(&batch()).is_err());
    }
}
