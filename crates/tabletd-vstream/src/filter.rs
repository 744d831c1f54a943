//! Filter rules and row plans
//!
//! A session's filter is an ordered list of rules. Each rule matches a table
//! by literal name or by `/regex/`, and optionally carries a SQL-like filter
//! expression: a projection plus a conjunction of predicates over equality,
//! `IN`, and `in_keyrange(...)`. A row passes when some rule's match applies
//! and its expression evaluates true.
//!
//! Rules compile against a table's resolved fields into a [`TablePlan`]:
//! column ordinals are bound once, evaluation is per row.

use crate::keyrange::{keyspace_id, vindex_by_name, KeyRange, Vindex};
use crate::vevent::{Field, Row};
use regex::Regex;
use std::sync::Arc;
use tabletd_core::{Result, TabletError};

/// How a rule selects tables.
#[derive(Debug, Clone)]
pub enum MatchSpec {
    /// Literal table name.
    Table(String),
    /// Regex, written `/expr/` in the rule. Anchored on both ends.
    Pattern(Regex),
}

impl MatchSpec {
    pub fn matches(&self, table: &str) -> bool {
        match self {
            MatchSpec::Table(name) => name == table,
            MatchSpec::Pattern(re) => re.is_match(table),
        }
    }
}

/// One filter rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub match_spec: MatchSpec,
    /// Optional `select ... from ... where ...` expression.
    pub filter: Option<String>,
}

impl Rule {
    /// Build a rule from the wire form: a literal name, or `/regex/`.
    pub fn new(match_expr: &str, filter: Option<&str>) -> Result<Self> {
        let match_spec = if let Some(stripped) = match_expr.strip_prefix('/') {
            let pattern = stripped.strip_suffix('/').unwrap_or(stripped);
            let anchored = format!("^(?:{pattern})$");
            MatchSpec::Pattern(Regex::new(&anchored).map_err(|e| {
                TabletError::failed_precondition(format!("invalid match regex {match_expr:?}: {e}"))
            })?)
        } else {
            MatchSpec::Table(match_expr.to_string())
        };
        Ok(Self {
            match_spec,
            filter: filter.map(str::to_string),
        })
    }
}

/// An ordered rule list.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub rules: Vec<Rule>,
}

impl Filter {
    /// Match everything, unfiltered.
    pub fn pass_all() -> Result<Self> {
        Ok(Self {
            rules: vec![Rule::new("/.*/", None)?],
        })
    }

    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// The first rule matching `table`, if any.
    pub fn rule_for(&self, table: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.match_spec.matches(table))
    }
}

/// One predicate of a compiled filter expression.
pub enum Predicate {
    Eq(usize, Vec<u8>),
    In(usize, Vec<Vec<u8>>),
    InKeyrange {
        columns: Vec<usize>,
        vindex: Arc<dyn Vindex>,
        range: KeyRange,
    },
}

/// A rule compiled against a table's fields.
pub struct TablePlan {
    pub table: String,
    /// Column ordinals to project, or `None` for all columns.
    pub projection: Option<Vec<usize>>,
    pub predicates: Vec<Predicate>,
}

impl TablePlan {
    /// Evaluate the predicate conjunction against a row image. A predicate
    /// over a column the image does not carry fails closed.
    pub fn filter_row(&self, row: &Row) -> bool {
        self.predicates.iter().all(|p| match p {
            Predicate::Eq(col, value) => row.column(*col) == Some(value.as_slice()),
            Predicate::In(col, values) => row
                .column(*col)
                .map(|v| values.iter().any(|candidate| candidate.as_slice() == v))
                .unwrap_or(false),
            Predicate::InKeyrange {
                columns,
                vindex,
                range,
            } => {
                let mut values = Vec::with_capacity(columns.len());
                for col in columns {
                    match row.column(*col) {
                        Some(v) => values.push(v),
                        None => return false,
                    }
                }
                keyspace_id(vindex.as_ref(), &values)
                    .map(|id| range.contains(&id))
                    .unwrap_or(false)
            }
        })
    }

    /// Apply the projection to a row image.
    pub fn project(&self, row: &Row) -> Row {
        match &self.projection {
            None => row.clone(),
            Some(columns) => {
                let picked: Vec<Option<Vec<u8>>> = columns
                    .iter()
                    .map(|col| row.column(*col).map(|v| v.to_vec()))
                    .collect();
                Row::from_columns(&picked)
            }
        }
    }

    /// Apply the projection to the field list.
    pub fn project_fields(&self, fields: &[Field]) -> Vec<Field> {
        match &self.projection {
            None => fields.to_vec(),
            Some(columns) => columns
                .iter()
                .filter_map(|col| fields.get(*col).cloned())
                .collect(),
        }
    }
}

/// Compile `rule` for `table` against its fields. `default_vindex` is used
/// by single-argument `in_keyrange` (over the first column).
pub fn build_plan(
    rule: &Rule,
    table: &str,
    fields: &[Field],
    default_vindex: &str,
) -> Result<TablePlan> {
    let Some(filter) = &rule.filter else {
        return Ok(TablePlan {
            table: table.to_string(),
            projection: None,
            predicates: Vec::new(),
        });
    };
    parse_filter_expr(filter, table, fields, default_vindex)
}

fn column_index(fields: &[Field], name: &str) -> Result<usize> {
    fields
        .iter()
        .position(|f| f.name == name)
        .ok_or_else(|| TabletError::failed_precondition(format!("unknown column {name:?}")))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(String),
    Str(String),
    Star,
    Comma,
    LParen,
    RParen,
    Eq,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '\'' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => s.push(c),
                        None => {
                            return Err(TabletError::failed_precondition(
                                "unterminated string in filter",
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut s = String::new();
                s.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Number(s));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(s));
            }
            other => {
                return Err(TabletError::failed_precondition(format!(
                    "unexpected character {other:?} in filter"
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    fields: &'a [Field],
    default_vindex: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| TabletError::failed_precondition("truncated filter expression"))?;
        self.pos += 1;
        Ok(token)
    }

    fn expect_ident(&mut self, keyword: &str) -> Result<()> {
        match self.next()? {
            Token::Ident(word) if word.eq_ignore_ascii_case(keyword) => Ok(()),
            other => Err(TabletError::failed_precondition(format!(
                "expected {keyword:?} in filter, got {other:?}"
            ))),
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.next()? {
            Token::Ident(word) => Ok(word),
            other => Err(TabletError::failed_precondition(format!(
                "expected identifier in filter, got {other:?}"
            ))),
        }
    }

    fn value(&mut self) -> Result<Vec<u8>> {
        match self.next()? {
            Token::Number(n) => Ok(n.into_bytes()),
            Token::Str(s) => Ok(s.into_bytes()),
            other => Err(TabletError::failed_precondition(format!(
                "expected literal in filter, got {other:?}"
            ))),
        }
    }
}

fn parse_filter_expr(
    input: &str,
    table: &str,
    fields: &[Field],
    default_vindex: &str,
) -> Result<TablePlan> {
    let mut parser = Parser {
        tokens: tokenize(input)?,
        pos: 0,
        fields,
        default_vindex,
    };

    parser.expect_ident("select")?;

    // Projection: `*` or a column list.
    let projection = if parser.peek() == Some(&Token::Star) {
        parser.next()?;
        None
    } else {
        let mut columns = vec![column_index(fields, &parser.ident()?)?];
        while parser.peek() == Some(&Token::Comma) {
            parser.next()?;
            columns.push(column_index(fields, &parser.ident()?)?);
        }
        Some(columns)
    };

    parser.expect_ident("from")?;
    let from_table = parser.ident()?;
    if from_table != table {
        return Err(TabletError::failed_precondition(format!(
            "filter table {from_table:?} does not match rule table {table:?}"
        )));
    }

    let mut predicates = Vec::new();
    if parser.peek().is_some() {
        parser.expect_ident("where")?;
        loop {
            predicates.push(parse_predicate(&mut parser)?);
            match parser.peek() {
                Some(Token::Ident(word)) if word.eq_ignore_ascii_case("and") => {
                    parser.next()?;
                }
                None => break,
                Some(other) => {
                    return Err(TabletError::failed_precondition(format!(
                        "expected AND in filter, got {other:?}"
                    )))
                }
            }
        }
    }

    Ok(TablePlan {
        table: table.to_string(),
        projection,
        predicates,
    })
}

fn parse_predicate(parser: &mut Parser<'_>) -> Result<Predicate> {
    let name = parser.ident()?;
    if name.eq_ignore_ascii_case("in_keyrange") {
        return parse_in_keyrange(parser);
    }
    let column = column_index(parser.fields, &name)?;
    match parser.next()? {
        Token::Eq => Ok(Predicate::Eq(column, parser.value()?)),
        Token::Ident(word) if word.eq_ignore_ascii_case("in") => {
            match parser.next()? {
                Token::LParen => {}
                other => {
                    return Err(TabletError::failed_precondition(format!(
                        "expected ( after IN, got {other:?}"
                    )))
                }
            }
            let mut values = vec![parser.value()?];
            while parser.peek() == Some(&Token::Comma) {
                parser.next()?;
                values.push(parser.value()?);
            }
            match parser.next()? {
                Token::RParen => {}
                other => {
                    return Err(TabletError::failed_precondition(format!(
                        "expected ) after IN list, got {other:?}"
                    )))
                }
            }
            Ok(Predicate::In(column, values))
        }
        other => Err(TabletError::failed_precondition(format!(
            "expected = or IN after column, got {other:?}"
        ))),
    }
}

fn parse_in_keyrange(parser: &mut Parser<'_>) -> Result<Predicate> {
    match parser.next()? {
        Token::LParen => {}
        other => {
            return Err(TabletError::failed_precondition(format!(
                "expected ( after in_keyrange, got {other:?}"
            )))
        }
    }

    // Either in_keyrange('<range>') over the first column with the session's
    // default vindex, or in_keyrange(col, 'vindex', '<range>').
    let predicate = match parser.next()? {
        Token::Str(range) => Predicate::InKeyrange {
            columns: vec![0],
            vindex: vindex_by_name(parser.default_vindex)?,
            range: KeyRange::parse(&range)?,
        },
        Token::Ident(column_name) => {
            let mut columns = vec![column_index(parser.fields, &column_name)?];
            // Further leading columns of a multi-column vindex.
            loop {
                match parser.peek() {
                    Some(Token::Comma) => {
                        parser.next()?;
                        match parser.next()? {
                            Token::Ident(next_col) => {
                                columns.push(column_index(parser.fields, &next_col)?)
                            }
                            Token::Str(vindex_name) => {
                                // vindex name, then the range.
                                let vindex = vindex_by_name(&vindex_name)?;
                                match parser.next()? {
                                    Token::Comma => {}
                                    other => {
                                        return Err(TabletError::failed_precondition(format!(
                                            "expected , before range, got {other:?}"
                                        )))
                                    }
                                }
                                let range = match parser.next()? {
                                    Token::Str(range) => KeyRange::parse(&range)?,
                                    other => {
                                        return Err(TabletError::failed_precondition(format!(
                                            "expected range string, got {other:?}"
                                        )))
                                    }
                                };
                                match parser.next()? {
                                    Token::RParen => {}
                                    other => {
                                        return Err(TabletError::failed_precondition(format!(
                                            "expected ) after in_keyrange, got {other:?}"
                                        )))
                                    }
                                }
                                return Ok(Predicate::InKeyrange {
                                    columns,
                                    vindex,
                                    range,
                                });
                            }
                            other => {
                                return Err(TabletError::failed_precondition(format!(
                                    "unexpected {other:?} in in_keyrange arguments"
                                )))
                            }
                        }
                    }
                    other => {
                        return Err(TabletError::failed_precondition(format!(
                            "unexpected {other:?} in in_keyrange arguments"
                        )))
                    }
                }
            }
        }
        other => {
            return Err(TabletError::failed_precondition(format!(
                "unexpected {other:?} in in_keyrange arguments"
            )))
        }
    };

    match parser.next()? {
        Token::RParen => Ok(predicate),
        other => Err(TabletError::failed_precondition(format!(
            "expected ) after in_keyrange, got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::event::ColumnType;

    fn fields() -> Vec<Field> {
        vec![
            Field::new("id", ColumnType::Long),
            Field::new("v", ColumnType::Varchar),
            Field::new("extra", ColumnType::Long),
        ]
    }

    fn row(values: &[&str]) -> Row {
        Row::from_columns(
            &values
                .iter()
                .map(|v| Some(v.as_bytes().to_vec()))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn test_rule_matching() {
        let literal = Rule::new("t1", None).unwrap();
        assert!(literal.match_spec.matches("t1"));
        assert!(!literal.match_spec.matches("t10"));

        let pattern = Rule::new("/t.*/", None).unwrap();
        assert!(pattern.match_spec.matches("t1"));
        assert!(pattern.match_spec.matches("t_other"));
        assert!(!pattern.match_spec.matches("users"));

        let filter = Filter::new(vec![
            Rule::new("t1", Some("select id from t1")).unwrap(),
            Rule::new("/.*/", None).unwrap(),
        ]);
        assert!(filter.rule_for("t1").unwrap().filter.is_some());
        assert!(filter.rule_for("anything").unwrap().filter.is_none());
    }

    #[test]
    fn test_plan_select_star() {
        let rule = Rule::new("t1", Some("select * from t1")).unwrap();
        let plan = build_plan(&rule, "t1", &fields(), "numeric").unwrap();
        assert!(plan.projection.is_none());
        assert!(plan.predicates.is_empty());
        assert!(plan.filter_row(&row(&["1", "aaa", "9"])));
    }

    #[test]
    fn test_plan_projection() {
        let rule = Rule::new("t1", Some("select id, v from t1")).unwrap();
        let plan = build_plan(&rule, "t1", &fields(), "numeric").unwrap();
        assert_eq!(plan.projection, Some(vec![0, 1]));
        let projected = plan.project(&row(&["1", "aaa", "9"]));
        assert_eq!(projected.lengths, vec![1, 3]);
        assert_eq!(projected.values, b"1aaa");
        let projected_fields = plan.project_fields(&fields());
        let names: Vec<&str> = projected_fields
            .iter()
            .map(|f| f.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, ["id", "v"]);
    }

    #[test]
    fn test_plan_eq_and_in() {
        let rule = Rule::new(
            "t1",
            Some("select * from t1 where id = 5 and v in ('aaa', 'bbb')"),
        )
        .unwrap();
        let plan = build_plan(&rule, "t1", &fields(), "numeric").unwrap();
        assert!(plan.filter_row(&row(&["5", "aaa", "0"])));
        assert!(plan.filter_row(&row(&["5", "bbb", "0"])));
        assert!(!plan.filter_row(&row(&["5", "ccc", "0"])));
        assert!(!plan.filter_row(&row(&["6", "aaa", "0"])));
    }

    #[test]
    fn test_plan_in_keyrange_default_vindex() {
        let rule = Rule::new("t1", Some("select * from t1 where in_keyrange('-80')")).unwrap();
        let plan = build_plan(&rule, "t1", &fields(), "numeric").unwrap();
        // Numeric vindex: small ids are in -80, ids >= 2^63 are not.
        assert!(plan.filter_row(&row(&["1", "aaa", "0"])));
        assert!(!plan.filter_row(&row(&["9223372036854775808", "aaa", "0"])));
    }

    #[test]
    fn test_plan_in_keyrange_named_vindex() {
        let rule = Rule::new(
            "t1",
            Some("select * from t1 where in_keyrange(id, 'numeric', '80-')"),
        )
        .unwrap();
        let plan = build_plan(&rule, "t1", &fields(), "hash").unwrap();
        assert!(!plan.filter_row(&row(&["1", "aaa", "0"])));
        assert!(plan.filter_row(&row(&["9223372036854775808", "aaa", "0"])));
    }

    #[test]
    fn test_plan_multi_column_vindex() {
        let rule = Rule::new(
            "t1",
            Some("select * from t1 where in_keyrange(id, extra, 'numeric', '-80')"),
        )
        .unwrap();
        let plan = build_plan(&rule, "t1", &fields(), "numeric").unwrap();
        // Keyspace id is numeric(id) ++ numeric(extra): first column decides
        // the prefix comparison against the single-byte bound.
        assert!(plan.filter_row(&row(&["1", "x", "2"])));
        assert!(!plan.filter_row(&row(&["9223372036854775808", "x", "2"])));
    }

    #[test]
    fn test_predicate_on_missing_column_fails_closed() {
        let rule = Rule::new("t1", Some("select * from t1 where v = 'aaa'")).unwrap();
        let plan = build_plan(&rule, "t1", &fields(), "numeric").unwrap();
        let partial = Row::from_columns(&[Some(b"1".to_vec()), None, Some(b"0".to_vec())]);
        assert!(!plan.filter_row(&partial));
    }

    #[test]
    fn test_parse_errors() {
        let fields = fields();
        for bad in [
            "select from t1",
            "select * from other",
            "select * from t1 where nosuch = 1",
            "select * from t1 where id = ",
            "select * from t1 where in_keyrange(",
            "select * from t1 where id = 1 or v = 'x'",
        ] {
            let rule = Rule::new("t1", Some(bad)).unwrap();
            assert!(
                build_plan(&rule, "t1", &fields, "numeric").is_err(),
                "expected parse failure for {bad:?}"
            );
        }
    }
}
