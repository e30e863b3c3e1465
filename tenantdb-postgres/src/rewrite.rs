//! Tenant scoping for SQL statements.
//!
//! A tenant-scoped [`PgClient`](crate::PgClient) passes every statement
//! through [`scope_statement`] before it reaches the server. The statement is
//! tokenized (string literals, quoted identifiers, comments and dollar quotes
//! are understood) and rewritten so that it can only touch the tenant's rows:
//!
//! | Statement | Rewrite |
//! |-----------|---------|
//! | `SELECT ... FROM t` | `WHERE t."col" = $n` added, or ANDed with the existing condition |
//! | `... JOIN u ON cond` | `ON u."col" = $n AND (cond)` |
//! | `UPDATE t SET ...` | as `SELECT`, also for tables in `FROM` |
//! | `DELETE FROM t` | as `SELECT`, also for tables in `USING` |
//! | `INSERT INTO t (a) VALUES (..)` | the column and `$n` are appended to every row |
//!
//! `$n` is a new parameter bound to the tenant id. Shared tables are left
//! alone.
//!
//! Anything the rewriter cannot confine is rejected rather than run
//! unfiltered: subqueries (the `TABLE` and `VALUES` forms too), set
//! operations (`UNION` and friends), `WITH`, several statements in one
//! string, `INSERT ... SELECT`, inserts without a column list,
//! `ON CONFLICT DO UPDATE`, writes to the tenant column, table functions and
//! any statement other than `SELECT`, `INSERT`, `UPDATE` and `DELETE`.
//!
//! ```rust
//! use serde_json::json;
//! use tenantdb_core::{TenantId, TenantScope};
//! use tenantdb_postgres::rewrite::scope_statement;
//!
//! let scope = TenantScope::new(TenantId::new("acme").unwrap(), "tenant_id");
//! let scoped = scope_statement("SELECT * FROM orders WHERE total > $1", &[json!(10)], &scope).unwrap();
//! assert_eq!(scoped.sql, r#"SELECT * FROM orders WHERE orders."tenant_id" = $2 AND (total > $1)"#);
//! assert_eq!(scoped.params, vec![json!(10), json!("acme")]);
//! ```

use serde_json::Value;
use tenantdb_core::{TenantError, TenantResult, TenantScope};

/// A statement ready to run on a tenant-scoped client.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedStatement {
    /// The rewritten SQL.
    pub sql: String,
    /// The parameters, with the tenant id appended when the SQL uses it.
    pub params: Vec<Value>,
}

/// Confine `sql` to `scope`'s tenant.
pub fn scope_statement(sql: &str, params: &[Value], scope: &TenantScope) -> TenantResult<ScopedStatement> {
    let statement = Statement::parse(sql)?;
    statement.check_shape(params.len())?;

    let mut rewriter = Rewriter {
        statement: &statement,
        scope,
        param: params.len() + 1,
        edits: Vec::new(),
        filters: Vec::new(),
    };
    rewriter.rewrite()?;

    if rewriter.edits.is_empty() {
        return Ok(ScopedStatement {
            sql: sql.to_string(),
            params: params.to_vec(),
        });
    }

    let mut edits = rewriter.edits;
    edits.sort_by_key(|(at, _)| *at);

    let mut out = String::with_capacity(sql.len() + 64);
    let mut cursor = 0;
    for (at, text) in edits {
        out.push_str(&sql[cursor..at]);
        out.push_str(&text);
        cursor = at;
    }
    out.push_str(&sql[cursor..]);

    let mut params = params.to_vec();
    params.push(Value::String(scope.tenant().to_string()));
    Ok(ScopedStatement { sql: out, params })
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Kind {
    Word,
    Quoted,
    Literal,
    Param(usize),
    Number,
    Punct(char),
}

#[derive(Debug, Clone, Copy)]
struct Token {
    kind: Kind,
    start: usize,
    end: usize,
}

/// Words that end a table reference instead of naming its alias.
const RESERVED: &[&str] = &[
    "WHERE", "GROUP", "HAVING", "ORDER", "LIMIT", "OFFSET", "FETCH", "FOR", "WINDOW", "RETURNING",
    "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "CROSS", "NATURAL", "OUTER", "ON", "USING", "SET",
    "UNION", "INTERSECT", "EXCEPT", "VALUES", "LATERAL", "TABLESAMPLE", "DEFAULT", "SELECT",
    "OVERRIDING",
];

/// Words that end a `WHERE` condition.
const AFTER_WHERE: &[&str] = &[
    "GROUP", "HAVING", "ORDER", "LIMIT", "OFFSET", "FETCH", "FOR", "WINDOW", "RETURNING",
];

const JOIN_WORDS: &[&str] = &["JOIN", "INNER", "LEFT", "RIGHT", "FULL", "CROSS", "NATURAL", "OUTER"];

fn unterminated(what: &str) -> TenantError {
    TenantError::invalid_query(format!("Unterminated {} in SQL statement", what))
}

fn tokenize(sql: &str) -> TenantResult<Vec<Token>> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let start = i;
        let c = bytes[i];
        let kind = match c {
            c if c.is_ascii_whitespace() => {
                i += 1;
                continue;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let close = sql[i + 2..].find("*/").ok_or_else(|| unterminated("comment"))?;
                i += 2 + close + 2;
                continue;
            }
            b'\'' => {
                i = skip_quoted(bytes, i + 1, b'\'', false).ok_or_else(|| unterminated("string literal"))?;
                Kind::Literal
            }
            b'"' => {
                i = skip_quoted(bytes, i + 1, b'"', false).ok_or_else(|| unterminated("quoted identifier"))?;
                Kind::Quoted
            }
            b'$' => {
                let digits = bytes[i + 1..].iter().take_while(|b| b.is_ascii_digit()).count();
                if digits > 0 {
                    let n = sql[i + 1..i + 1 + digits]
                        .parse()
                        .map_err(|_| TenantError::invalid_query("Parameter number out of range"))?;
                    i += 1 + digits;
                    Kind::Param(n)
                } else {
                    let tag_len = bytes[i + 1..]
                        .iter()
                        .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
                        .count();
                    let tag_end = i + 1 + tag_len;
                    if bytes.get(tag_end) != Some(&b'$') {
                        return Err(TenantError::invalid_query("Unexpected '$' in SQL statement"));
                    }
                    let tag = &sql[i..=tag_end];
                    let close = sql[tag_end + 1..]
                        .find(tag)
                        .ok_or_else(|| unterminated("dollar-quoted string"))?;
                    i = tag_end + 1 + close + tag.len();
                    Kind::Literal
                }
            }
            b'e' | b'E' if bytes.get(i + 1) == Some(&b'\'') => {
                i = skip_quoted(bytes, i + 2, b'\'', true).ok_or_else(|| unterminated("string literal"))?;
                Kind::Literal
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'$') {
                    i += 1;
                }
                Kind::Word
            }
            c if c.is_ascii_digit() => {
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                Kind::Number
            }
            _ => {
                let ch = sql[i..].chars().next().unwrap_or('\u{fffd}');
                i += ch.len_utf8().max(1);
                Kind::Punct(ch)
            }
        };
        tokens.push(Token { kind, start, end: i });
    }

    Ok(tokens)
}

/// Index just past the closing `quote`, honoring doubled quotes (and
/// backslash escapes in `E'...'` strings).
fn skip_quoted(bytes: &[u8], mut i: usize, quote: u8, backslash: bool) -> Option<usize> {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if backslash => i += 2,
            b if b == quote => {
                if bytes.get(i + 1) == Some(&quote) {
                    i += 2;
                } else {
                    return Some(i + 1);
                }
            }
            _ => i += 1,
        }
    }
    None
}

struct Statement<'a> {
    sql: &'a str,
    tokens: Vec<Token>,
    depth: Vec<usize>,
}

#[derive(Debug, Clone)]
struct TableRef {
    /// Unquoted name, for matching against shared tables.
    name: String,
    /// The name or alias as written, for qualifying the tenant column.
    qualifier: String,
}

impl<'a> Statement<'a> {
    fn parse(sql: &'a str) -> TenantResult<Self> {
        let tokens = tokenize(sql)?;
        let mut depth = Vec::with_capacity(tokens.len());
        let mut level = 0usize;
        for token in &tokens {
            match token.kind {
                Kind::Punct('(') => {
                    depth.push(level);
                    level += 1;
                }
                Kind::Punct(')') => {
                    level = level
                        .checked_sub(1)
                        .ok_or_else(|| TenantError::invalid_query("Unbalanced parentheses in SQL statement"))?;
                    depth.push(level);
                }
                _ => depth.push(level),
            }
        }
        if level != 0 {
            return Err(TenantError::invalid_query("Unbalanced parentheses in SQL statement"));
        }
        Ok(Self { sql, tokens, depth })
    }

    fn len(&self) -> usize {
        self.tokens.len()
    }

    fn text(&self, i: usize) -> &'a str {
        let token = &self.tokens[i];
        &self.sql[token.start..token.end]
    }

    fn kind(&self, i: usize) -> Option<Kind> {
        self.tokens.get(i).map(|t| t.kind)
    }

    fn is_kw(&self, i: usize, keyword: &str) -> bool {
        self.kind(i) == Some(Kind::Word) && self.text(i).eq_ignore_ascii_case(keyword)
    }

    fn is_any_kw(&self, i: usize, keywords: &[&str]) -> bool {
        keywords.iter().any(|kw| self.is_kw(i, kw))
    }

    fn is_punct(&self, i: usize, c: char) -> bool {
        self.kind(i) == Some(Kind::Punct(c))
    }

    /// An identifier as the server sees it: unquoted words fold to lower case.
    fn ident(&self, i: usize) -> Option<String> {
        match self.kind(i)? {
            Kind::Word => Some(self.text(i).to_ascii_lowercase()),
            Kind::Quoted => {
                let text = self.text(i);
                Some(text[1..text.len() - 1].replace("\"\"", "\""))
            }
            _ => None,
        }
    }

    fn names_column(&self, i: usize, column: &str) -> bool {
        match self.kind(i) {
            Some(Kind::Word) => self.text(i).eq_ignore_ascii_case(column),
            Some(Kind::Quoted) => self.ident(i).as_deref() == Some(column),
            _ => false,
        }
    }

    fn matching_paren(&self, open: usize) -> usize {
        let depth = self.depth[open];
        (open + 1..self.len())
            .find(|&i| self.is_punct(i, ')') && self.depth[i] == depth)
            .unwrap_or(self.len())
    }

    /// First top-level index at or after `from` that `stop` accepts, a `;`,
    /// or the end of the statement.
    fn clause_end(&self, from: usize, stop: impl Fn(usize) -> bool) -> usize {
        (from..self.len())
            .find(|&i| self.depth[i] == 0 && (self.is_punct(i, ';') || stop(i)))
            .unwrap_or(self.len())
    }

    /// Reject statement shapes no rewrite can confine.
    fn check_shape(&self, param_count: usize) -> TenantResult<()> {
        if self.tokens.is_empty() {
            return Err(TenantError::invalid_query("Empty SQL statement"));
        }

        for i in 0..self.len() {
            match self.kind(i) {
                Some(Kind::Punct(';')) if i + 1 < self.len() => {
                    return Err(TenantError::unsupported_query(
                        "Multiple statements cannot run on a tenant-scoped client",
                    ));
                }
                Some(Kind::Param(n)) if n == 0 || n > param_count => {
                    return Err(TenantError::invalid_query(format!(
                        "Placeholder ${} has no parameter ({} given)",
                        n, param_count
                    )));
                }
                Some(Kind::Word) if i > 0 && self.starts_subquery(i) => {
                    return Err(TenantError::unsupported_query(
                        "Subqueries cannot run on a tenant-scoped client",
                    ));
                }
                Some(Kind::Word) if self.is_any_kw(i, &["UNION", "INTERSECT", "EXCEPT"]) => {
                    return Err(TenantError::unsupported_query(format!(
                        "{} cannot run on a tenant-scoped client",
                        self.text(i).to_ascii_uppercase()
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Whether the keyword at `i` begins a nested query. `TABLE name` and
    /// `VALUES` are full queries in PostgreSQL, just like `SELECT`.
    fn starts_subquery(&self, i: usize) -> bool {
        if self.is_kw(i, "SELECT") {
            return true;
        }
        i > 0 && self.is_punct(i - 1, '(') && self.is_any_kw(i, &["TABLE", "VALUES", "WITH"])
    }

    /// Parse a possibly schema-qualified table name at `i`.
    fn table_name(&self, i: usize) -> TenantResult<(TableRef, usize)> {
        let mut name = self
            .ident(i)
            .ok_or_else(|| TenantError::invalid_query(format!("Expected a table name at '{}'", self.snippet(i))))?;
        let mut end = i + 1;
        while self.is_punct(end, '.') {
            let part = self
                .ident(end + 1)
                .ok_or_else(|| TenantError::invalid_query("Expected a name after '.'"))?;
            name.push('.');
            name.push_str(&part);
            end += 2;
        }

        let qualifier = self.sql[self.tokens[i].start..self.tokens[end - 1].end].to_string();
        Ok((TableRef { name, qualifier }, end))
    }

    /// Parse a table reference with its optional alias.
    fn table_ref(&self, i: usize) -> TenantResult<(TableRef, usize)> {
        let mut i = i;
        if self.is_kw(i, "ONLY") {
            i += 1;
        }
        if self.is_punct(i, '(') || self.is_kw(i, "LATERAL") {
            return Err(TenantError::unsupported_query(
                "Derived tables cannot run on a tenant-scoped client",
            ));
        }

        let (mut table, mut i) = self.table_name(i)?;
        if self.is_punct(i, '(') {
            return Err(TenantError::unsupported_query(format!(
                "Table function '{}' cannot run on a tenant-scoped client",
                table.name
            )));
        }
        if self.is_punct(i, '*') {
            i += 1;
        }

        let alias = if self.is_kw(i, "AS") {
            if self.ident(i + 1).is_none() {
                return Err(TenantError::invalid_query("Expected an alias after AS"));
            }
            Some(i + 1)
        } else if self.kind(i) == Some(Kind::Quoted)
            || (self.kind(i) == Some(Kind::Word) && !self.is_any_kw(i, RESERVED))
        {
            Some(i)
        } else {
            None
        };

        if let Some(at) = alias {
            table.qualifier = self.text(at).to_string();
            i = at + 1;
            if self.is_punct(i, '(') {
                i = self.matching_paren(i) + 1;
            }
        }
        Ok((table, i))
    }

    fn snippet(&self, i: usize) -> &'a str {
        match self.tokens.get(i) {
            Some(token) => &self.sql[token.start..token.end],
            None => "end of statement",
        }
    }
}

struct Rewriter<'s, 'a> {
    statement: &'s Statement<'a>,
    scope: &'s TenantScope,
    param: usize,
    edits: Vec<(usize, String)>,
    filters: Vec<TableRef>,
}

impl Rewriter<'_, '_> {
    fn rewrite(&mut self) -> TenantResult<()> {
        let s = self.statement;
        if s.is_kw(0, "SELECT") {
            self.select()
        } else if s.is_kw(0, "UPDATE") {
            self.update()
        } else if s.is_kw(0, "DELETE") {
            self.delete()
        } else if s.is_kw(0, "INSERT") {
            self.insert()
        } else {
            Err(TenantError::unsupported_query(format!(
                "'{}' statements cannot run on a tenant-scoped client",
                s.snippet(0).to_ascii_uppercase()
            )))
        }
    }

    fn predicate(&self, table: &TableRef) -> String {
        format!("{}.\"{}\" = ${}", table.qualifier, self.scope.column(), self.param)
    }

    fn filter(&mut self, table: TableRef) {
        if !self.scope.is_shared(&table.name) {
            self.filters.push(table);
        }
    }

    fn select(&mut self) -> TenantResult<()> {
        let s = self.statement;
        let Some(from) = (1..s.len()).find(|&i| s.depth[i] == 0 && s.is_kw(i, "FROM")) else {
            // No table, nothing to confine.
            return Ok(());
        };
        let next = self.from_list(from + 1)?;
        self.apply_where(next)
    }

    fn update(&mut self) -> TenantResult<()> {
        let s = self.statement;
        let (target, set) = s.table_ref(1)?;
        if !s.is_kw(set, "SET") {
            return Err(TenantError::invalid_query(format!(
                "Expected SET at '{}'",
                s.snippet(set)
            )));
        }

        let set_end = s.clause_end(set + 1, |i| s.is_any_kw(i, &["FROM", "WHERE", "RETURNING"]));
        if !self.scope.is_shared(&target.name) {
            self.check_assignments(set + 1, set_end)?;
        }
        self.filter(target);

        let next = if s.is_kw(set_end, "FROM") {
            self.from_list(set_end + 1)?
        } else {
            set_end
        };
        self.apply_where(next)
    }

    fn delete(&mut self) -> TenantResult<()> {
        let s = self.statement;
        if !s.is_kw(1, "FROM") {
            return Err(TenantError::invalid_query("Expected DELETE FROM"));
        }
        let (target, mut next) = s.table_ref(2)?;
        self.filter(target);
        if s.is_kw(next, "USING") {
            next = self.from_list(next + 1)?;
        }
        self.apply_where(next)
    }

    fn insert(&mut self) -> TenantResult<()> {
        let s = self.statement;
        let column = self.scope.column();
        if !s.is_kw(1, "INTO") {
            return Err(TenantError::invalid_query("Expected INSERT INTO"));
        }

        let (table, mut i) = s.table_name(2)?;
        if self.scope.is_shared(&table.name) {
            return Ok(());
        }
        if s.is_kw(i, "AS") {
            i += 2;
        }

        if s.is_kw(i, "DEFAULT") {
            return Err(TenantError::unsupported_query(
                "INSERT ... DEFAULT VALUES cannot run on a tenant-scoped client",
            ));
        }
        if !s.is_punct(i, '(') {
            return Err(TenantError::unsupported_query(
                "INSERT on a tenant-scoped client needs an explicit column list",
            ));
        }

        let close = s.matching_paren(i);
        if (i + 1..close).any(|k| s.depth[k] == 1 && s.names_column(k, column)) {
            return Err(tenant_column_written(column));
        }
        self.edits.push((s.tokens[close].start, format!(", \"{}\"", column)));
        i = close + 1;

        if s.is_kw(i, "OVERRIDING") {
            i += 3;
        }
        if !s.is_kw(i, "VALUES") {
            return Err(TenantError::unsupported_query(
                "Only INSERT ... VALUES can run on a tenant-scoped client",
            ));
        }
        i += 1;

        loop {
            if !s.is_punct(i, '(') {
                return Err(TenantError::invalid_query(format!(
                    "Expected a VALUES row at '{}'",
                    s.snippet(i)
                )));
            }
            let close = s.matching_paren(i);
            if close >= s.len() {
                return Err(TenantError::invalid_query("Unterminated VALUES row"));
            }
            self.edits.push((s.tokens[close].start, format!(", ${}", self.param)));
            i = close + 1;
            if s.is_punct(i, ',') {
                i += 1;
            } else {
                break;
            }
        }

        if (i..s.len()).any(|k| s.is_kw(k, "DO") && s.is_kw(k + 1, "UPDATE")) {
            return Err(TenantError::unsupported_query(
                "ON CONFLICT DO UPDATE cannot run on a tenant-scoped client",
            ));
        }
        Ok(())
    }

    /// Reject `SET` lists that assign the tenant column.
    fn check_assignments(&self, start: usize, end: usize) -> TenantResult<()> {
        let s = self.statement;
        let column = self.scope.column();
        let mut i = start;
        while i < end {
            if s.is_punct(i, '(') {
                let close = s.matching_paren(i);
                if (i + 1..close).any(|k| s.names_column(k, column)) {
                    return Err(tenant_column_written(column));
                }
            } else if s.names_column(i, column) {
                return Err(tenant_column_written(column));
            }
            // Skip to the next top-level assignment.
            i = (i..end)
                .find(|&k| s.depth[k] == 0 && s.is_punct(k, ','))
                .map_or(end, |k| k + 1);
        }
        Ok(())
    }

    /// Walk a `FROM`/`USING` list. Returns the index after it.
    fn from_list(&mut self, start: usize) -> TenantResult<usize> {
        let s = self.statement;
        let mut i = start;

        'tables: loop {
            let (table, next) = s.table_ref(i)?;
            self.filter(table);
            i = next;

            loop {
                if s.is_punct(i, ',') {
                    i += 1;
                    continue 'tables;
                }

                let mut j = i;
                let mut joined = false;
                while s.is_any_kw(j, JOIN_WORDS) || s.is_kw(j, "JOIN") {
                    if s.is_kw(j, "JOIN") {
                        joined = true;
                        j += 1;
                        break;
                    }
                    j += 1;
                }
                if !joined {
                    return Ok(i);
                }

                let (table, next) = s.table_ref(j)?;
                i = next;

                if s.is_kw(i, "ON") {
                    let cond = i + 1;
                    let end = s.clause_end(cond, |k| {
                        s.is_punct(k, ',')
                            || s.is_any_kw(k, JOIN_WORDS)
                            || s.is_kw(k, "WHERE")
                            || s.is_any_kw(k, AFTER_WHERE)
                    });
                    if end <= cond {
                        return Err(TenantError::invalid_query("Empty ON condition"));
                    }
                    if !self.scope.is_shared(&table.name) {
                        let predicate = self.predicate(&table);
                        self.edits
                            .push((s.tokens[cond].start, format!("{} AND (", predicate)));
                        self.edits.push((s.tokens[end - 1].end, ")".to_string()));
                    }
                    i = end;
                } else {
                    if s.is_kw(i, "USING") && s.is_punct(i + 1, '(') {
                        i = s.matching_paren(i + 1) + 1;
                    }
                    // NATURAL, CROSS and USING joins are filtered in WHERE.
                    self.filter(table);
                }
            }
        }
    }

    /// Add the collected filters at `i`, where a `WHERE` clause is or would go.
    fn apply_where(&mut self, i: usize) -> TenantResult<()> {
        let s = self.statement;
        if self.filters.is_empty() {
            return Ok(());
        }

        let predicate = self
            .filters
            .iter()
            .map(|table| self.predicate(table))
            .collect::<Vec<_>>()
            .join(" AND ");

        if s.is_kw(i, "WHERE") {
            let cond = i + 1;
            let end = s.clause_end(cond, |k| s.is_any_kw(k, AFTER_WHERE));
            if end <= cond {
                return Err(TenantError::invalid_query("Empty WHERE condition"));
            }
            self.edits.push((s.tokens[cond].start, format!("{} AND (", predicate)));
            self.edits.push((s.tokens[end - 1].end, ")".to_string()));
        } else if i < s.len() && !s.is_punct(i, ';') && !s.is_any_kw(i, AFTER_WHERE) {
            return Err(TenantError::invalid_query(format!(
                "Unexpected '{}' in SQL statement",
                s.snippet(i)
            )));
        } else {
            let at = s.tokens[i - 1].end;
            self.edits.push((at, format!(" WHERE {}", predicate)));
        }
        Ok(())
    }
}

fn tenant_column_written(column: &str) -> TenantError {
    TenantError::unsupported_query(format!(
        "The tenant column '{}' is set by the tenant-scoped client and cannot be written",
        column
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tenantdb_core::{ErrorCode, TenantId};

    fn scope() -> TenantScope {
        let shared: HashSet<String> = ["plans".to_string()].into_iter().collect();
        TenantScope::new(TenantId::new("acme").unwrap(), "tenant_id").with_shared_tables(Arc::new(shared))
    }

    fn scoped(sql: &str, params: &[Value]) -> ScopedStatement {
        scope_statement(sql, params, &scope()).unwrap()
    }

    fn rejected(sql: &str) -> TenantError {
        scope_statement(sql, &[], &scope()).unwrap_err()
    }

    #[test]
    fn test_select_without_where() {
        let out = scoped("SELECT id, total FROM orders ORDER BY id", &[]);
        assert_eq!(
            out.sql,
            r#"SELECT id, total FROM orders WHERE orders."tenant_id" = $1 ORDER BY id"#
        );
        assert_eq!(out.params, vec![json!("acme")]);
    }

    #[test]
    fn test_select_with_where_and_alias() {
        let out = scoped("SELECT o.id FROM orders AS o WHERE o.total > $1 OR o.id = $2 LIMIT 5", &[json!(1), json!(2)]);
        assert_eq!(
            out.sql,
            r#"SELECT o.id FROM orders AS o WHERE o."tenant_id" = $3 AND (o.total > $1 OR o.id = $2) LIMIT 5"#
        );
        assert_eq!(out.params, vec![json!(1), json!(2), json!("acme")]);
    }

    #[test]
    fn test_select_join_filters_in_on_clause() {
        let out = scoped(
            "SELECT o.id, c.name FROM orders o LEFT JOIN customers c ON c.id = o.customer_id WHERE o.total > 5",
            &[],
        );
        assert_eq!(
            out.sql,
            r#"SELECT o.id, c.name FROM orders o LEFT JOIN customers c ON c."tenant_id" = $1 AND (c.id = o.customer_id) WHERE o."tenant_id" = $1 AND (o.total > 5)"#
        );
    }

    #[test]
    fn test_select_comma_join_and_shared_table() {
        let out = scoped("SELECT * FROM orders o, plans p, public.invoices", &[]);
        assert_eq!(
            out.sql,
            r#"SELECT * FROM orders o, plans p, public.invoices WHERE o."tenant_id" = $1 AND public.invoices."tenant_id" = $1"#
        );
    }

    #[test]
    fn test_shared_only_is_untouched() {
        let out = scoped("SELECT * FROM plans WHERE id = $1", &[json!(3)]);
        assert_eq!(out.sql, "SELECT * FROM plans WHERE id = $1");
        assert_eq!(out.params, vec![json!(3)]);
    }

    #[test]
    fn test_select_without_from_passes_through() {
        let out = scoped("SELECT 1 AS one, now()", &[]);
        assert_eq!(out.sql, "SELECT 1 AS one, now()");
        assert!(out.params.is_empty());
    }

    #[test]
    fn test_literals_and_comments_are_opaque() {
        let out = scoped(
            "SELECT * FROM notes /* from; select */ WHERE body = 'union; select' AND tag = $$x;y$$ -- trailing",
            &[],
        );
        assert_eq!(
            out.sql,
            r#"SELECT * FROM notes /* from; select */ WHERE notes."tenant_id" = $1 AND (body = 'union; select' AND tag = $$x;y$$) -- trailing"#
        );
    }

    #[test]
    fn test_trailing_semicolon() {
        let out = scoped("DELETE FROM orders;", &[]);
        assert_eq!(out.sql, r#"DELETE FROM orders WHERE orders."tenant_id" = $1;"#);
    }

    #[test]
    fn test_quoted_table() {
        let out = scoped(r#"SELECT * FROM "Orders" FOR UPDATE"#, &[]);
        assert_eq!(
            out.sql,
            r#"SELECT * FROM "Orders" WHERE "Orders"."tenant_id" = $1 FOR UPDATE"#
        );
    }

    #[test]
    fn test_insert_values() {
        let out = scoped(
            "INSERT INTO orders (id, total) VALUES ($1, $2), ($3, $4) RETURNING id",
            &[json!(1), json!(10), json!(2), json!(20)],
        );
        assert_eq!(
            out.sql,
            r#"INSERT INTO orders (id, total, "tenant_id") VALUES ($1, $2, $5), ($3, $4, $5) RETURNING id"#
        );
        assert_eq!(out.params.len(), 5);
        assert_eq!(out.params[4], json!("acme"));
    }

    #[test]
    fn test_insert_on_conflict_do_nothing() {
        let out = scoped("INSERT INTO orders (id) VALUES (1) ON CONFLICT (id) DO NOTHING", &[]);
        assert_eq!(
            out.sql,
            r#"INSERT INTO orders (id, "tenant_id") VALUES (1, $1) ON CONFLICT (id) DO NOTHING"#
        );
    }

    #[test]
    fn test_insert_into_shared_table() {
        let out = scoped("INSERT INTO plans VALUES (1, 'pro')", &[]);
        assert_eq!(out.sql, "INSERT INTO plans VALUES (1, 'pro')");
    }

    #[test]
    fn test_update() {
        let out = scoped("UPDATE orders SET total = $1, note = 'a, b' WHERE id = $2", &[json!(5), json!(1)]);
        assert_eq!(
            out.sql,
            r#"UPDATE orders SET total = $1, note = 'a, b' WHERE orders."tenant_id" = $3 AND (id = $2)"#
        );
    }

    #[test]
    fn test_update_from() {
        let out = scoped(
            "UPDATE orders o SET total = i.amount FROM invoices i WHERE i.order_id = o.id RETURNING o.id",
            &[],
        );
        assert_eq!(
            out.sql,
            r#"UPDATE orders o SET total = i.amount FROM invoices i WHERE o."tenant_id" = $1 AND i."tenant_id" = $1 AND (i.order_id = o.id) RETURNING o.id"#
        );
    }

    #[test]
    fn test_delete_using() {
        let out = scoped("DELETE FROM orders o USING customers c WHERE c.id = o.customer_id", &[]);
        assert_eq!(
            out.sql,
            r#"DELETE FROM orders o USING customers c WHERE o."tenant_id" = $1 AND c."tenant_id" = $1 AND (c.id = o.customer_id)"#
        );
    }

    #[test]
    fn test_rejects_unconfinable_statements() {
        let cases = [
            "SELECT * FROM orders WHERE id IN (SELECT order_id FROM refunds)",
            "SELECT EXISTS (TABLE secrets)",
            "SELECT * FROM orders WHERE id IN (TABLE refunds)",
            "UPDATE orders SET note = (TABLE notes LIMIT 1) WHERE id = 1",
            "DELETE FROM orders WHERE id IN (VALUES (1), (2))",
            "SELECT * FROM orders WHERE id = ANY (ARRAY(WITH r AS (SELECT 1) TABLE r))",
            "SELECT * FROM orders WHERE id IN ((WITH r AS (TABLE refunds) TABLE r))",
            "SELECT id FROM orders UNION SELECT id FROM archive",
            "SELECT id FROM orders; DELETE FROM orders",
            "WITH recent AS (SELECT 1) SELECT 1",
            "INSERT INTO orders SELECT * FROM staging",
            "INSERT INTO orders VALUES (1, 2)",
            "INSERT INTO orders DEFAULT VALUES",
            "INSERT INTO orders (id) VALUES (1) ON CONFLICT (id) DO UPDATE SET id = 2",
            "INSERT INTO orders (id, tenant_id) VALUES (1, 'globex')",
            r#"UPDATE orders SET "tenant_id" = 'globex'"#,
            "UPDATE orders SET (total, TENANT_ID) = (1, 'globex')",
            "SELECT * FROM generate_series(1, 3)",
            "SELECT * FROM (VALUES (1)) v",
            "DROP TABLE orders",
            "TRUNCATE orders",
        ];
        for sql in cases {
            let err = rejected(sql);
            assert_eq!(err.code, ErrorCode::UnsupportedQuery, "{}", sql);
        }
    }

    #[test]
    fn test_with_and_values_outside_subqueries() {
        let out = scoped(
            "SELECT CAST(created_at AS timestamp with time zone) FROM orders WHERE values_count > 1",
            &[],
        );
        assert_eq!(
            out.sql,
            r#"SELECT CAST(created_at AS timestamp with time zone) FROM orders WHERE orders."tenant_id" = $1 AND (values_count > 1)"#
        );
    }

    #[test]
    fn test_shared_table_tenant_column_may_be_written() {
        let out = scoped("UPDATE plans SET tenant_id = NULL", &[]);
        assert_eq!(out.sql, "UPDATE plans SET tenant_id = NULL");
    }

    #[test]
    fn test_invalid_statements() {
        for sql in ["", "SELECT * FROM orders WHERE (a = 1", "SELECT 'open", "SELECT * FROM orders WHERE id = $2"] {
            let err = scope_statement(sql, &[json!(1)], &scope()).unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidQuery, "{:?}", sql);
        }
    }

    #[test]
    fn test_escape_string() {
        let out = scoped(r"SELECT * FROM notes WHERE body = E'it\'s'", &[]);
        assert_eq!(
            out.sql,
            r#"SELECT * FROM notes WHERE notes."tenant_id" = $1 AND (body = E'it\'s')"#
        );
    }
}
