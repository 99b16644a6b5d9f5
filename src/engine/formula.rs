//! Safe evaluation of the user-supplied arithmetic formula over result
//! columns.
//!
//! The formula references numeric column names directly (`Flow - Baseflow`).
//! It is validated against a closed character set, then parsed by a small
//! tokenizer + recursive-descent parser over `+ - * /`, numbers and column
//! identifiers, and evaluated element-wise against the column vectors. There
//! is deliberately no path to any general-purpose evaluator: the grammar is
//! the whole language.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use polars::prelude::*;
use regex::Regex;

use crate::catalog::ProjectContext;
use crate::error::{AppError, AppResult};
use crate::request::DbTable;

/// Identifier sanitizer: column names keep their letters only, so any name
/// the project uses becomes a valid formula identifier.
static NON_LETTER: Lazy<Regex> = Lazy::new(|| Regex::new("[^A-Za-z]").unwrap());

fn sanitize(name: &str) -> String {
    NON_LETTER.replace_all(name, "").into_owned()
}

/// Replace every occurrence of a known column name in one left-to-right
/// scan, longest name first, so one column name embedded in another is never
/// clobbered.
fn substitute_columns<F: Fn(&str) -> String>(formula: &str, sorted_cols: &[String], repl: F) -> String {
    let mut out = String::with_capacity(formula.len());
    let mut rest = formula;
    'outer: while !rest.is_empty() {
        for c in sorted_cols {
            if rest.starts_with(c.as_str()) {
                out.push_str(&repl(c));
                rest = &rest[c.len()..];
                continue 'outer;
            }
        }
        let ch = rest.chars().next().unwrap();
        out.push(ch);
        rest = &rest[ch.len_utf8()..];
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
}

fn tokenize(src: &str) -> AppResult<Vec<Tok>> {
    let bytes = src.as_bytes();
    let mut toks = Vec::new();
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                toks.push(Tok::Plus);
                i += 1;
            }
            '-' => {
                toks.push(Tok::Minus);
                i += 1;
            }
            '*' => {
                toks.push(Tok::Star);
                i += 1;
            }
            '/' => {
                toks.push(Tok::Slash);
                i += 1;
            }
            _ if c.is_ascii_digit() || c == '.' => {
                let start = i;
                let mut dot = false;
                while i < bytes.len() {
                    let ch = bytes[i] as char;
                    if ch.is_ascii_digit() {
                        i += 1;
                    } else if ch == '.' && !dot {
                        dot = true;
                        i += 1;
                    } else {
                        break;
                    }
                }
                let v: f64 = src[start..i]
                    .parse()
                    .map_err(|_| invalid_formula())?;
                toks.push(Tok::Num(v));
            }
            _ if c.is_ascii_alphabetic() => {
                let start = i;
                while i < bytes.len() && (bytes[i] as char).is_ascii_alphabetic() {
                    i += 1;
                }
                toks.push(Tok::Ident(src[start..i].to_string()));
            }
            _ => return Err(invalid_formula()),
        }
    }
    Ok(toks)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone)]
enum Node {
    Num(f64),
    Col(String),
    Neg(Box<Node>),
    Bin { op: Op, left: Box<Node>, right: Box<Node> },
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn parse(toks: Vec<Tok>) -> AppResult<Node> {
        let mut p = Parser { toks, pos: 0 };
        let node = p.expr()?;
        if p.pos != p.toks.len() {
            return Err(invalid_formula());
        }
        Ok(node)
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn expr(&mut self) -> AppResult<Node> {
        let mut left = self.term()?;
        while let Some(tok) = self.peek() {
            let op = match tok {
                Tok::Plus => Op::Add,
                Tok::Minus => Op::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.term()?;
            left = Node::Bin { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn term(&mut self) -> AppResult<Node> {
        let mut left = self.factor()?;
        while let Some(tok) = self.peek() {
            let op = match tok {
                Tok::Star => Op::Mul,
                Tok::Slash => Op::Div,
                _ => break,
            };
            self.pos += 1;
            let right = self.factor()?;
            left = Node::Bin { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn factor(&mut self) -> AppResult<Node> {
        match self.peek() {
            Some(Tok::Minus) => {
                self.pos += 1;
                Ok(Node::Neg(Box::new(self.factor()?)))
            }
            Some(Tok::Num(v)) => {
                let v = *v;
                self.pos += 1;
                Ok(Node::Num(v))
            }
            Some(Tok::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(Node::Col(name))
            }
            _ => Err(invalid_formula()),
        }
    }
}

fn collect_idents(node: &Node, out: &mut HashSet<String>) {
    match node {
        Node::Col(name) => {
            out.insert(name.clone());
        }
        Node::Neg(inner) => collect_idents(inner, out),
        Node::Bin { left, right, .. } => {
            collect_idents(left, out);
            collect_idents(right, out);
        }
        Node::Num(_) => {}
    }
}

/// Columns appearing as the right-hand side of a division; their stored
/// zeros are replaced with a small epsilon before evaluation.
fn collect_divisors(node: &Node, out: &mut HashSet<String>) {
    match node {
        Node::Bin { op, left, right } => {
            if *op == Op::Div {
                let mut target: &Node = right;
                while let Node::Neg(inner) = target {
                    target = inner;
                }
                if let Node::Col(name) = target {
                    out.insert(name.clone());
                }
            }
            collect_divisors(left, out);
            collect_divisors(right, out);
        }
        Node::Neg(inner) => collect_divisors(inner, out),
        _ => {}
    }
}

enum EvalValue {
    Scalar(f64),
    Vector(Vec<f64>),
}

fn eval(node: &Node, columns: &HashMap<String, Vec<f64>>) -> AppResult<EvalValue> {
    match node {
        Node::Num(v) => Ok(EvalValue::Scalar(*v)),
        Node::Col(name) => columns
            .get(name)
            .map(|v| EvalValue::Vector(v.clone()))
            .ok_or_else(invalid_formula),
        Node::Neg(inner) => Ok(match eval(inner, columns)? {
            EvalValue::Scalar(v) => EvalValue::Scalar(-v),
            EvalValue::Vector(v) => EvalValue::Vector(v.into_iter().map(|x| -x).collect()),
        }),
        Node::Bin { op, left, right } => {
            let l = eval(left, columns)?;
            let r = eval(right, columns)?;
            let f = |a: f64, b: f64| match op {
                Op::Add => a + b,
                Op::Sub => a - b,
                Op::Mul => a * b,
                Op::Div => a / b,
            };
            Ok(match (l, r) {
                (EvalValue::Scalar(a), EvalValue::Scalar(b)) => EvalValue::Scalar(f(a, b)),
                (EvalValue::Scalar(a), EvalValue::Vector(b)) => {
                    EvalValue::Vector(b.into_iter().map(|x| f(a, x)).collect())
                }
                (EvalValue::Vector(a), EvalValue::Scalar(b)) => {
                    EvalValue::Vector(a.into_iter().map(|x| f(x, b)).collect())
                }
                (EvalValue::Vector(a), EvalValue::Vector(b)) => {
                    EvalValue::Vector(a.into_iter().zip(b).map(|(x, y)| f(x, y)).collect())
                }
            })
        }
    }
}

fn invalid_formula() -> AppError {
    AppError::validation("invalid_formula", "Invalid characters or columns in the formula.")
}

fn column_as_f64(df: &DataFrame, name: &str) -> AppResult<Vec<f64>> {
    let ca = df.column(name)?.cast(&DataType::Float64)?;
    Ok(ca.f64()?.into_iter().map(|o| o.unwrap_or(f64::NAN)).collect())
}

/// Evaluate `formula` against the frame's numeric columns.
///
/// Comma-separated formulas run in multi-assignment mode: each sub-expression
/// updates the one existing column it names, and the reported feature name is
/// empty. A single expression is appended as a new column named by the
/// human-readable feature name (the formula with real column names
/// substituted where an alias mapping exists).
pub fn apply_formula(
    ctx: &ProjectContext,
    mut df: DataFrame,
    formula: &str,
    db_tables: &[DbTable],
    id_column: &str,
) -> AppResult<(DataFrame, String)> {
    let numeric_cols: Vec<String> = df
        .get_column_names()
        .iter()
        .filter(|c| c.as_str() != id_column)
        .filter(|c| {
            matches!(
                df.column(c.as_str()).map(|col| col.dtype().clone()),
                Ok(DataType::Int64) | Ok(DataType::Float64)
            )
        })
        .map(|c| c.to_string())
        .collect();

    let mut sorted_cols = numeric_cols.clone();
    sorted_cols.sort_by_key(|c| std::cmp::Reverse(c.len()));

    // Validation: with every known column name substituted away, only
    // digits, decimal points, whitespace and `+ - * / ,` may remain.
    let residue = substitute_columns(formula, &sorted_cols, |_| "0".to_string());
    if !residue
        .chars()
        .all(|ch| ch.is_ascii_digit() || ch.is_whitespace() || "+-*/,.".contains(ch))
    {
        return Err(invalid_formula());
    }

    let sanitized_formula = substitute_columns(formula, &sorted_cols, |c| sanitize(c));

    // Real (un-aliased) column names for the display name of the derived
    // feature, where the request's tables carry an alias mapping.
    let mut real_names: HashMap<String, String> = HashMap::new();
    for spec in db_tables {
        let map = ctx.alias.column_map(&spec.table);
        for c in &numeric_cols {
            if let Some(real) = map.get(c) {
                real_names.entry(c.clone()).or_insert_with(|| real.clone());
            }
        }
    }

    let pieces: Vec<&str> = sanitized_formula.split(',').collect();
    let parsed: Vec<Node> = pieces
        .iter()
        .map(|p| Parser::parse(tokenize(p)?))
        .collect::<AppResult<Vec<_>>>()?;

    // Divisor columns: replace stored zeros with a small epsilon, in the
    // frame itself and in the evaluation vectors.
    let mut divisors = HashSet::new();
    for node in &parsed {
        collect_divisors(node, &mut divisors);
    }
    let mut vectors: HashMap<String, Vec<f64>> = HashMap::new();
    for c in &numeric_cols {
        let mut values = column_as_f64(&df, c)?;
        if divisors.contains(&sanitize(c)) {
            for v in values.iter_mut() {
                if *v == 0.0 {
                    *v = 0.001;
                }
            }
            df.replace(c, Series::new(c.as_str().into(), values.clone()))?;
        }
        vectors.entry(sanitize(c)).or_insert(values);
    }

    let height = df.height();
    let materialize = |v: EvalValue| -> Vec<f64> {
        match v {
            EvalValue::Scalar(s) => vec![s; height],
            EvalValue::Vector(v) => v,
        }
    };

    if pieces.len() > 1 {
        // Multi-assignment: each sub-expression updates the existing column
        // it references. Evaluation uses the original vectors throughout, so
        // assignment order does not cascade.
        for c in &numeric_cols {
            let ident = sanitize(c);
            for node in &parsed {
                let mut idents = HashSet::new();
                collect_idents(node, &mut idents);
                if idents.contains(&ident) {
                    let values = materialize(eval(node, &vectors)?);
                    df.replace(c, Series::new(c.as_str().into(), values))?;
                }
            }
        }
        Ok((df, String::new()))
    } else {
        let feature = substitute_columns(formula, &sorted_cols, |c| {
            real_names.get(c).cloned().unwrap_or_else(|| c.to_string())
        });
        let values = materialize(eval(&parsed[0], &vectors)?);
        let series = Series::new(feature.as_str().into(), values);
        df.with_column(series)?;
        Ok((df, feature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn frame() -> DataFrame {
        DataFrame::new(vec![
            Series::new("ID".into(), vec![1i64, 1, 2]).into(),
            Series::new("Flow".into(), vec![10.0f64, 4.0, 2.5]).into(),
            Series::new("Baseflow".into(), vec![4.0f64, 4.0, 0.0]).into(),
        ])
        .unwrap()
    }

    fn ctx() -> ProjectContext {
        ProjectContext::new(Config::default())
    }

    #[test]
    fn rejects_disallowed_characters() {
        let tables = vec![];
        for bad in ["Flow; DROP TABLE x", "Flow - Sneaky", "Flow ** Baseflow", "__import__"] {
            let err = apply_formula(&ctx(), frame(), bad, &tables, "ID").unwrap_err();
            assert_eq!(err.message(), "Invalid characters or columns in the formula.");
        }
    }

    #[test]
    fn single_expression_appends_derived_column() {
        let (df, feature) = apply_formula(&ctx(), frame(), "Flow - Baseflow", &[], "ID").unwrap();
        assert_eq!(feature, "Flow - Baseflow");
        let derived = df.column("Flow - Baseflow").unwrap().f64().unwrap();
        assert_eq!(derived.get(0), Some(6.0));
        assert_eq!(derived.get(1), Some(0.0));
        assert_eq!(derived.get(2), Some(2.5));
    }

    #[test]
    fn precedence_and_unary_minus() {
        let (df, _) = apply_formula(&ctx(), frame(), "Flow + Baseflow * 2", &[], "ID").unwrap();
        let derived = df.column("Flow + Baseflow * 2").unwrap().f64().unwrap();
        assert_eq!(derived.get(0), Some(18.0));
        let (df, _) = apply_formula(&ctx(), frame(), "-Flow * 2", &[], "ID").unwrap();
        assert_eq!(df.column("-Flow * 2").unwrap().f64().unwrap().get(0), Some(-20.0));
    }

    #[test]
    fn division_by_zero_uses_epsilon() {
        let (df, _) = apply_formula(&ctx(), frame(), "Flow / Baseflow", &[], "ID").unwrap();
        // row 2 has Baseflow == 0, replaced by 0.001 before evaluating
        let derived = df.column("Flow / Baseflow").unwrap().f64().unwrap();
        assert_eq!(derived.get(2), Some(2500.0));
        // the stored column reflects the substitution as well
        assert_eq!(df.column("Baseflow").unwrap().f64().unwrap().get(2), Some(0.001));
    }

    #[test]
    fn comma_formula_updates_columns_in_place() {
        let (df, feature) =
            apply_formula(&ctx(), frame(), "Flow * 2, Baseflow + 1", &[], "ID").unwrap();
        assert_eq!(feature, "");
        assert_eq!(df.column("Flow").unwrap().f64().unwrap().get(0), Some(20.0));
        assert_eq!(df.column("Baseflow").unwrap().f64().unwrap().get(0), Some(5.0));
        // no derived column was appended
        assert_eq!(df.width(), 3);
    }

    #[test]
    fn feature_name_substitutes_real_column_names() {
        let ctx = ctx();
        ctx.alias.register("rch_01", "Reach", "qo", "Flow");
        ctx.alias.register("rch_01", "Reach", "qb", "Baseflow");
        let tables = vec![DbTable { db: "out.db3".into(), table: "Reach".into() }];
        let (_, feature) = apply_formula(&ctx, frame(), "Flow - Baseflow", &tables, "ID").unwrap();
        assert_eq!(feature, "qo - qb");
    }

    #[test]
    fn identifier_column_is_not_a_formula_column() {
        let err = apply_formula(&ctx(), frame(), "ID + Flow", &[], "ID").unwrap_err();
        assert_eq!(err.message(), "Invalid characters or columns in the formula.");
    }
}
