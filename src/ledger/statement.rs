//! PartiQL subset understood by the in-process ledger.
//!
//! ```text
//! CREATE TABLE t
//! DROP TABLE t
//! CREATE INDEX ON t (field)
//! INSERT INTO t VALUE <expr>
//! INSERT INTO t << <expr>, ... >>
//! SELECT * FROM t [WHERE field = <expr> [AND ...]]
//! UPDATE t SET field = <expr>[, ...] [WHERE ...]
//! DELETE FROM t [WHERE ...]
//! ```
//!
//! `<expr>` is a literal (`'text'`, number, `true`, `false`, `null`), a struct
//! `{ 'key': <expr>, ... }`, a list `[<expr>, ...]` or a `?` placeholder.

use crate::core::{LedgerError, LedgerResult};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Number, Value};

lazy_static! {
    static ref TOKEN: Regex = Regex::new(
        r#"^(?:(?P<ws>\s+)|(?P<str>'(?:[^']|'')*')|(?P<qid>"(?:[^"]|"")*")|(?P<num>-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?)|(?P<ident>[A-Za-z_][A-Za-z0-9_]*)|(?P<sym><<|>>|[{}\[\](),:=*?.;]))"#
    )
    .expect("token pattern is valid");
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Num(Number),
    Ident(String),
    QuotedIdent(String),
    Sym(&'static str),
}

const SYMBOLS: [&str; 15] = [
    "<<", ">>", "{", "}", "[", "]", "(", ")", ",", ":", "=", "*", "?", ".", ";",
];

fn symbol(text: &str) -> &'static str {
    SYMBOLS.iter().copied().find(|s| *s == text).unwrap_or("")
}

fn tokenize(input: &str) -> LedgerResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < input.len() {
        let rest = &input[pos..];
        let caps = TOKEN.captures(rest).ok_or_else(|| {
            LedgerError::ParseError(format!("unexpected input at offset {}: '{}'", pos, rest))
        })?;
        let matched = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        if matched.is_empty() {
            return Err(LedgerError::ParseError(format!("unexpected input at offset {}", pos)));
        }
        pos += matched.len();

        if caps.name("ws").is_some() {
            continue;
        }
        if let Some(m) = caps.name("str") {
            let inner = &m.as_str()[1..m.as_str().len() - 1];
            tokens.push(Token::Str(inner.replace("''", "'")));
        } else if let Some(m) = caps.name("qid") {
            let inner = &m.as_str()[1..m.as_str().len() - 1];
            tokens.push(Token::QuotedIdent(inner.replace("\"\"", "\"")));
        } else if let Some(m) = caps.name("num") {
            tokens.push(Token::Num(parse_number(m.as_str())?));
        } else if let Some(m) = caps.name("ident") {
            tokens.push(Token::Ident(m.as_str().to_string()));
        } else if let Some(m) = caps.name("sym") {
            tokens.push(Token::Sym(symbol(m.as_str())));
        }
    }

    // A single trailing terminator is allowed
    if tokens.last() == Some(&Token::Sym(";")) {
        tokens.pop();
    }

    Ok(tokens)
}

fn parse_number(text: &str) -> LedgerResult<Number> {
    if let Ok(int) = text.parse::<i64>() {
        return Ok(Number::from(int));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .ok_or_else(|| LedgerError::ParseError(format!("invalid number '{}'", text)))
}

/// Value position in a statement: literal or placeholder
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Param(usize),
    Struct(Vec<(String, Expr)>),
    List(Vec<Expr>),
}

impl Expr {
    /// Substitute placeholders with `params`
    pub fn bind(&self, params: &[Value]) -> LedgerResult<Value> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Param(index) => params.get(*index).cloned().ok_or(LedgerError::ParameterMismatch {
                expected: index + 1,
                actual: params.len(),
            }),
            Expr::Struct(fields) => {
                let mut map = Map::new();
                for (key, expr) in fields {
                    map.insert(key.clone(), expr.bind(params)?);
                }
                Ok(Value::Object(map))
            }
            Expr::List(items) => items
                .iter()
                .map(|item| item.bind(params))
                .collect::<LedgerResult<Vec<_>>>()
                .map(Value::Array),
        }
    }
}

/// `field = value` predicate
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateTable { table: String },
    DropTable { table: String },
    CreateIndex { table: String, field: String },
    Insert { table: String, documents: Vec<Expr> },
    Select { table: String, filter: Vec<Condition> },
    Update { table: String, assignments: Vec<(String, Expr)>, filter: Vec<Condition> },
    Delete { table: String, filter: Vec<Condition> },
}

impl Statement {
    /// The table the statement addresses
    pub fn table(&self) -> &str {
        match self {
            Statement::CreateTable { table }
            | Statement::DropTable { table }
            | Statement::CreateIndex { table, .. }
            | Statement::Insert { table, .. }
            | Statement::Select { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => table,
        }
    }

    pub fn is_ddl(&self) -> bool {
        matches!(
            self,
            Statement::CreateTable { .. } | Statement::DropTable { .. } | Statement::CreateIndex { .. }
        )
    }
}

/// A statement together with the number of `?` placeholders it contains
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedStatement {
    pub statement: Statement,
    pub placeholders: usize,
}

/// Parse one statement
pub fn parse(text: &str) -> LedgerResult<ParsedStatement> {
    let tokens = tokenize(text)?;
    let mut parser = Parser { tokens, pos: 0, placeholders: 0 };
    let statement = parser.statement()?;

    if let Some(token) = parser.peek() {
        return Err(LedgerError::ParseError(format!("unexpected trailing token {:?}", token)));
    }

    Ok(ParsedStatement { statement, placeholders: parser.placeholders })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    placeholders: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> LedgerResult<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| LedgerError::ParseError("unexpected end of statement".to_string()))?;
        self.pos += 1;
        Ok(token)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn keyword(&mut self, keyword: &str) -> LedgerResult<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(LedgerError::ParseError(format!(
                "expected {}, found {:?}",
                keyword,
                self.peek()
            )))
        }
    }

    fn eat_symbol(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Some(Token::Sym(s)) if *s == sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn symbol(&mut self, sym: &str) -> LedgerResult<()> {
        if self.eat_symbol(sym) {
            Ok(())
        } else {
            Err(LedgerError::ParseError(format!("expected '{}', found {:?}", sym, self.peek())))
        }
    }

    fn identifier(&mut self) -> LedgerResult<String> {
        match self.next()? {
            Token::Ident(name) | Token::QuotedIdent(name) => Ok(name),
            other => Err(LedgerError::ParseError(format!("expected identifier, found {:?}", other))),
        }
    }

    /// Table names may be qualified, e.g. `information_schema.user_tables`
    fn table_name(&mut self) -> LedgerResult<String> {
        let mut name = self.identifier()?;
        while self.eat_symbol(".") {
            name.push('.');
            name.push_str(&self.identifier()?);
        }
        Ok(name)
    }

    fn statement(&mut self) -> LedgerResult<Statement> {
        if self.eat_keyword("CREATE") {
            if self.eat_keyword("TABLE") {
                return Ok(Statement::CreateTable { table: self.table_name()? });
            }
            self.keyword("INDEX")?;
            self.keyword("ON")?;
            let table = self.table_name()?;
            self.symbol("(")?;
            let field = self.identifier()?;
            self.symbol(")")?;
            return Ok(Statement::CreateIndex { table, field });
        }

        if self.eat_keyword("DROP") {
            self.keyword("TABLE")?;
            return Ok(Statement::DropTable { table: self.table_name()? });
        }

        if self.eat_keyword("INSERT") {
            self.keyword("INTO")?;
            let table = self.table_name()?;
            let documents = if self.eat_keyword("VALUE") {
                vec![self.expr()?]
            } else if self.eat_symbol("<<") {
                let mut documents = vec![self.expr()?];
                while self.eat_symbol(",") {
                    documents.push(self.expr()?);
                }
                self.symbol(">>")?;
                documents
            } else {
                return Err(LedgerError::ParseError("expected VALUE or '<<' after table".to_string()));
            };
            return Ok(Statement::Insert { table, documents });
        }

        if self.eat_keyword("SELECT") {
            self.symbol("*")?;
            self.keyword("FROM")?;
            let table = self.table_name()?;
            let filter = self.filter()?;
            return Ok(Statement::Select { table, filter });
        }

        if self.eat_keyword("UPDATE") {
            let table = self.table_name()?;
            self.keyword("SET")?;
            let mut assignments = Vec::new();
            loop {
                let field = self.identifier()?;
                self.symbol("=")?;
                assignments.push((field, self.expr()?));
                if !self.eat_symbol(",") {
                    break;
                }
            }
            let filter = self.filter()?;
            return Ok(Statement::Update { table, assignments, filter });
        }

        if self.eat_keyword("DELETE") {
            self.keyword("FROM")?;
            let table = self.table_name()?;
            let filter = self.filter()?;
            return Ok(Statement::Delete { table, filter });
        }

        Err(LedgerError::ParseError(format!("unsupported statement starting with {:?}", self.peek())))
    }

    fn filter(&mut self) -> LedgerResult<Vec<Condition>> {
        let mut conditions = Vec::new();
        if !self.eat_keyword("WHERE") {
            return Ok(conditions);
        }
        loop {
            let field = self.identifier()?;
            self.symbol("=")?;
            conditions.push(Condition { field, value: self.expr()? });
            if !self.eat_keyword("AND") {
                break;
            }
        }
        Ok(conditions)
    }

    fn expr(&mut self) -> LedgerResult<Expr> {
        match self.next()? {
            Token::Str(text) => Ok(Expr::Literal(Value::String(text))),
            Token::Num(number) => Ok(Expr::Literal(Value::Number(number))),
            Token::Ident(word) if word.eq_ignore_ascii_case("true") => Ok(Expr::Literal(Value::Bool(true))),
            Token::Ident(word) if word.eq_ignore_ascii_case("false") => Ok(Expr::Literal(Value::Bool(false))),
            Token::Ident(word) if word.eq_ignore_ascii_case("null") => Ok(Expr::Literal(Value::Null)),
            Token::Sym("?") => {
                let index = self.placeholders;
                self.placeholders += 1;
                Ok(Expr::Param(index))
            }
            Token::Sym("{") => {
                let mut fields = Vec::new();
                if self.eat_symbol("}") {
                    return Ok(Expr::Struct(fields));
                }
                loop {
                    let key = match self.next()? {
                        Token::Str(key) | Token::Ident(key) | Token::QuotedIdent(key) => key,
                        other => {
                            return Err(LedgerError::ParseError(format!(
                                "expected struct key, found {:?}",
                                other
                            )));
                        }
                    };
                    self.symbol(":")?;
                    fields.push((key, self.expr()?));
                    if !self.eat_symbol(",") {
                        break;
                    }
                }
                self.symbol("}")?;
                Ok(Expr::Struct(fields))
            }
            Token::Sym("[") => {
                let mut items = Vec::new();
                if self.eat_symbol("]") {
                    return Ok(Expr::List(items));
                }
                loop {
                    items.push(self.expr()?);
                    if !self.eat_symbol(",") {
                        break;
                    }
                }
                self.symbol("]")?;
                Ok(Expr::List(items))
            }
            other => Err(LedgerError::ParseError(format!("expected value, found {:?}", other))),
        }
    }
}

/// Split a migration body into statements.
///
/// Statements are separated by `;` outside quoted text. `--` starts a comment
/// running to the end of the line and `/* */` encloses a block comment.
/// Blank statements are dropped.
pub fn split_statements(body: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = body.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                '-' if chars.peek() == Some(&'-') => {
                    for skipped in chars.by_ref() {
                        if skipped == '\n' {
                            current.push('\n');
                            break;
                        }
                    }
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    let mut previous = '\0';
                    for skipped in chars.by_ref() {
                        if previous == '*' && skipped == '/' {
                            break;
                        }
                        previous = skipped;
                    }
                    current.push(' ');
                }
                ';' => {
                    push_statement(&mut statements, &current);
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }
    push_statement(&mut statements, &current);

    statements
}

fn push_statement(statements: &mut Vec<String>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_ddl() {
        assert_eq!(
            parse("CREATE TABLE Users").unwrap().statement,
            Statement::CreateTable { table: "Users".to_string() }
        );
        assert_eq!(
            parse("drop table Users;").unwrap().statement,
            Statement::DropTable { table: "Users".to_string() }
        );
        assert_eq!(
            parse("CREATE INDEX ON Users (email)").unwrap().statement,
            Statement::CreateIndex { table: "Users".to_string(), field: "email".to_string() }
        );
    }

    #[test]
    fn test_parse_insert_literal() {
        let parsed = parse("INSERT INTO Users VALUE {'name': 'O''Brien', 'age': 42, 'tags': ['a', true, null]}")
            .unwrap();
        let Statement::Insert { table, documents } = parsed.statement else {
            panic!("expected insert");
        };
        assert_eq!(table, "Users");
        assert_eq!(
            documents[0].bind(&[]).unwrap(),
            json!({"name": "O'Brien", "age": 42, "tags": ["a", true, null]})
        );
        assert_eq!(parsed.placeholders, 0);
    }

    #[test]
    fn test_parse_insert_bag_with_params() {
        let parsed = parse("INSERT INTO t << ?, {'id': ?} >>").unwrap();
        assert_eq!(parsed.placeholders, 2);

        let Statement::Insert { documents, .. } = parsed.statement else {
            panic!("expected insert");
        };
        let params = [json!({"id": 1}), json!(2)];
        assert_eq!(documents[0].bind(&params).unwrap(), json!({"id": 1}));
        assert_eq!(documents[1].bind(&params).unwrap(), json!({"id": 2}));
    }

    #[test]
    fn test_parse_select_with_filter() {
        let parsed = parse("SELECT * FROM information_schema.user_tables WHERE name = ? AND status = 'ACTIVE'")
            .unwrap();
        let Statement::Select { table, filter } = parsed.statement else {
            panic!("expected select");
        };
        assert_eq!(table, "information_schema.user_tables");
        assert_eq!(filter.len(), 2);
        assert_eq!(filter[0].value, Expr::Param(0));
        assert_eq!(filter[1].value, Expr::Literal(json!("ACTIVE")));
    }

    #[test]
    fn test_parse_update_and_delete() {
        let parsed = parse("UPDATE Accounts SET balance = 10.5, frozen = false WHERE id = 'a1'").unwrap();
        let Statement::Update { assignments, filter, .. } = parsed.statement else {
            panic!("expected update");
        };
        assert_eq!(assignments.len(), 2);
        assert_eq!(filter[0].field, "id");

        assert!(matches!(
            parse("DELETE FROM Accounts").unwrap().statement,
            Statement::Delete { filter, .. } if filter.is_empty()
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse("SELEC * FROM t"), Err(LedgerError::ParseError(_))));
        assert!(parse("CREATE TABLE").is_err());
        assert!(parse("INSERT INTO t {'a': 1}").is_err());
        assert!(parse("CREATE TABLE a b").is_err());
        assert!(parse("SELECT * FROM t WHERE a = #").is_err());
    }

    #[test]
    fn test_missing_param() {
        let parsed = parse("INSERT INTO t VALUE ?").unwrap();
        let Statement::Insert { documents, .. } = parsed.statement else {
            panic!("expected insert");
        };
        assert!(matches!(
            documents[0].bind(&[]),
            Err(LedgerError::ParameterMismatch { expected: 1, actual: 0 })
        ));
    }

    #[test]
    fn test_split_statements() {
        let body = "
            -- create the users table
            CREATE TABLE Users;
            INSERT INTO Users VALUE {'note': 'a;b -- not a comment'};

            CREATE INDEX ON Users (email)
        ";
        let statements = split_statements(body);
        assert_eq!(
            statements,
            vec![
                "CREATE TABLE Users".to_string(),
                "INSERT INTO Users VALUE {'note': 'a;b -- not a comment'}".to_string(),
                "CREATE INDEX ON Users (email)".to_string(),
            ]
        );
    }

    #[test]
    fn test_split_blank_body() {
        assert!(split_statements("  ;\n-- only a comment\n ; ").is_empty());
        assert!(split_statements("/* nothing; at all */ ;").is_empty());
    }

    #[test]
    fn test_split_skips_block_comments() {
        let body = "
            /* first; create
               the table */
            CREATE TABLE Orders;
            INSERT INTO Orders VALUE {'id': 1} /* trailing; note */;
            INSERT INTO Orders VALUE {'text': '/* kept; */'}
        ";
        assert_eq!(
            split_statements(body),
            vec![
                "CREATE TABLE Orders".to_string(),
                "INSERT INTO Orders VALUE {'id': 1}".to_string(),
                "INSERT INTO Orders VALUE {'text': '/* kept; */'}".to_string(),
            ]
        );
        assert_eq!(split_statements("CREATE/**/TABLE T").len(), 1);
    }
}
