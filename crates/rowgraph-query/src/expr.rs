//! Qualifier expressions.
//!
//! A qualifier is a boolean expression tree over *entity paths*: an atom
//! names an attribute of the query root ("name") or a dotted path through
//! relationships ("paintings.title"). Paths are mapping-level names; the
//! translator resolves them to aliased columns (adding joins as needed)
//! through a [`PathResolver`] while the tree renders itself to SQL.

use rowgraph_core::{Result, Value};

/// SQL dialect for placeholder and identifier rendering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier, doubling embedded quote characters.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{escaped}\"")
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{escaped}`")
            }
        }
    }

    /// Check if this dialect supports ILIKE.
    pub const fn supports_ilike(self) -> bool {
        matches!(self, Dialect::Postgres)
    }
}

/// Resolves an entity path to the SQL text of its aliased column.
///
/// Implemented by the translator, which also registers any joins the path
/// requires as a side effect of resolution.
pub trait PathResolver {
    /// SQL for the column the path lands on, e.g. `"t1"."title"`.
    fn resolve_path(&mut self, path: &str) -> Result<String>;
}

/// Comparison and logical operators usable in qualifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// Equal (=)
    Eq,
    /// Not equal (<>)
    Ne,
    /// Less than (<)
    Lt,
    /// Less than or equal (<=)
    Le,
    /// Greater than (>)
    Gt,
    /// Greater than or equal (>=)
    Ge,
    /// Logical AND
    And,
    /// Logical OR
    Or,
}

impl BinaryOp {
    /// Get the SQL representation of this operator.
    pub const fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
        }
    }

    /// Get the precedence of this operator (higher = binds tighter).
    pub const fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            _ => 3,
        }
    }
}

/// A qualifier expression tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    /// Entity path atom ("name", "paintings.title").
    Path(String),

    /// Literal value, bound as a parameter.
    Literal(Value),

    /// Binary operation.
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },

    /// Logical negation.
    Not(Box<Expr>),

    /// Path IN (values) / NOT IN.
    In {
        expr: Box<Expr>,
        values: Vec<Value>,
        negated: bool,
    },

    /// Path BETWEEN low AND high.
    Between {
        expr: Box<Expr>,
        low: Value,
        high: Value,
        negated: bool,
    },

    /// IS NULL / IS NOT NULL.
    IsNull { expr: Box<Expr>, negated: bool },

    /// LIKE / NOT LIKE pattern match.
    Like {
        expr: Box<Expr>,
        pattern: String,
        negated: bool,
        case_insensitive: bool,
    },
}

impl Expr {
    /// Entity-path atom.
    pub fn path(path: impl Into<String>) -> Self {
        Expr::Path(path.into())
    }

    /// Literal value.
    pub fn value(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    fn binary(self, op: BinaryOp, right: Expr) -> Self {
        Expr::Binary {
            left: Box::new(self),
            op,
            right: Box::new(right),
        }
    }

    /// `self = value`.
    pub fn eq(self, value: impl Into<Value>) -> Self {
        self.binary(BinaryOp::Eq, Expr::Literal(value.into()))
    }

    /// `self <> value`.
    pub fn ne(self, value: impl Into<Value>) -> Self {
        self.binary(BinaryOp::Ne, Expr::Literal(value.into()))
    }

    /// `self < value`.
    pub fn lt(self, value: impl Into<Value>) -> Self {
        self.binary(BinaryOp::Lt, Expr::Literal(value.into()))
    }

    /// `self <= value`.
    pub fn le(self, value: impl Into<Value>) -> Self {
        self.binary(BinaryOp::Le, Expr::Literal(value.into()))
    }

    /// `self > value`.
    pub fn gt(self, value: impl Into<Value>) -> Self {
        self.binary(BinaryOp::Gt, Expr::Literal(value.into()))
    }

    /// `self >= value`.
    pub fn ge(self, value: impl Into<Value>) -> Self {
        self.binary(BinaryOp::Ge, Expr::Literal(value.into()))
    }

    /// `self AND other`.
    #[must_use]
    pub fn and(self, other: Expr) -> Self {
        self.binary(BinaryOp::And, other)
    }

    /// `self OR other`.
    #[must_use]
    pub fn or(self, other: Expr) -> Self {
        self.binary(BinaryOp::Or, other)
    }

    /// `NOT self`.
    #[must_use]
    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    /// `self IN (values)`.
    #[must_use]
    pub fn in_values(self, values: Vec<Value>) -> Self {
        Expr::In {
            expr: Box::new(self),
            values,
            negated: false,
        }
    }

    /// `self BETWEEN low AND high`.
    #[must_use]
    pub fn between(self, low: impl Into<Value>, high: impl Into<Value>) -> Self {
        Expr::Between {
            expr: Box::new(self),
            low: low.into(),
            high: high.into(),
            negated: false,
        }
    }

    /// `self IS NULL`.
    #[must_use]
    pub fn is_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    /// `self IS NOT NULL`.
    #[must_use]
    pub fn is_not_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    /// `self LIKE pattern`.
    #[must_use]
    pub fn like(self, pattern: impl Into<String>) -> Self {
        Expr::Like {
            expr: Box::new(self),
            pattern: pattern.into(),
            negated: false,
            case_insensitive: false,
        }
    }

    /// Case-insensitive LIKE (ILIKE where supported, LOWER() otherwise).
    #[must_use]
    pub fn ilike(self, pattern: impl Into<String>) -> Self {
        Expr::Like {
            expr: Box::new(self),
            pattern: pattern.into(),
            negated: false,
            case_insensitive: true,
        }
    }

    /// All entity paths mentioned anywhere in the tree.
    pub fn paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Path(p) => out.push(p),
            Expr::Literal(_) => {}
            Expr::Binary { left, right, .. } => {
                left.collect_paths(out);
                right.collect_paths(out);
            }
            Expr::Not(inner) => inner.collect_paths(out),
            Expr::In { expr, .. }
            | Expr::Between { expr, .. }
            | Expr::IsNull { expr, .. }
            | Expr::Like { expr, .. } => expr.collect_paths(out),
        }
    }

    /// Build SQL, binding literals into `params` and resolving paths through
    /// the given resolver. `offset` counts parameters already bound by the
    /// surrounding statement.
    pub fn build(
        &self,
        dialect: Dialect,
        resolver: &mut dyn PathResolver,
        params: &mut Vec<Value>,
        offset: usize,
    ) -> Result<String> {
        Ok(match self {
            Expr::Path(path) => resolver.resolve_path(path)?,

            Expr::Literal(value) => {
                params.push(value.clone());
                dialect.placeholder(offset + params.len())
            }

            Expr::Binary { left, op, right } => {
                let left_sql = Self::build_operand(left, *op, dialect, resolver, params, offset)?;
                let right_sql = Self::build_operand(right, *op, dialect, resolver, params, offset)?;
                format!("{left_sql} {} {right_sql}", op.as_str())
            }

            Expr::Not(inner) => {
                let inner_sql = inner.build(dialect, resolver, params, offset)?;
                format!("NOT ({inner_sql})")
            }

            Expr::In {
                expr,
                values,
                negated,
            } => {
                let expr_sql = expr.build(dialect, resolver, params, offset)?;
                let placeholders: Vec<_> = values
                    .iter()
                    .map(|v| {
                        params.push(v.clone());
                        dialect.placeholder(offset + params.len())
                    })
                    .collect();
                let op = if *negated { "NOT IN" } else { "IN" };
                format!("{expr_sql} {op} ({})", placeholders.join(", "))
            }

            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let expr_sql = expr.build(dialect, resolver, params, offset)?;
                params.push(low.clone());
                let low_ph = dialect.placeholder(offset + params.len());
                params.push(high.clone());
                let high_ph = dialect.placeholder(offset + params.len());
                let op = if *negated { "NOT BETWEEN" } else { "BETWEEN" };
                format!("{expr_sql} {op} {low_ph} AND {high_ph}")
            }

            Expr::IsNull { expr, negated } => {
                let expr_sql = expr.build(dialect, resolver, params, offset)?;
                if *negated {
                    format!("{expr_sql} IS NOT NULL")
                } else {
                    format!("{expr_sql} IS NULL")
                }
            }

            Expr::Like {
                expr,
                pattern,
                negated,
                case_insensitive,
            } => {
                let expr_sql = expr.build(dialect, resolver, params, offset)?;
                params.push(Value::Text(pattern.clone()));
                let ph = dialect.placeholder(offset + params.len());
                let not = if *negated { "NOT " } else { "" };
                if *case_insensitive {
                    if dialect.supports_ilike() {
                        format!("{expr_sql} {not}ILIKE {ph}")
                    } else {
                        format!("LOWER({expr_sql}) {not}LIKE LOWER({ph})")
                    }
                } else {
                    format!("{expr_sql} {not}LIKE {ph}")
                }
            }
        })
    }

    /// Build a child of a binary node, parenthesizing when the child binds
    /// looser than the parent operator.
    fn build_operand(
        child: &Expr,
        parent_op: BinaryOp,
        dialect: Dialect,
        resolver: &mut dyn PathResolver,
        params: &mut Vec<Value>,
        offset: usize,
    ) -> Result<String> {
        let sql = child.build(dialect, resolver, params, offset)?;
        let needs_paren = matches!(
            child,
            Expr::Binary { op, .. } if op.precedence() < parent_op.precedence()
        );
        Ok(if needs_paren { format!("({sql})") } else { sql })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Resolver that renders paths as bare quoted identifiers.
    struct Bare;

    impl PathResolver for Bare {
        fn resolve_path(&mut self, path: &str) -> Result<String> {
            Ok(format!("\"{path}\""))
        }
    }

    fn render(expr: &Expr) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = expr
            .build(Dialect::Postgres, &mut Bare, &mut params, 0)
            .unwrap();
        (sql, params)
    }

    #[test]
    fn test_simple_comparison() {
        let (sql, params) = render(&Expr::path("name").eq("Picasso"));
        assert_eq!(sql, "\"name\" = $1");
        assert_eq!(params, vec![Value::Text("Picasso".to_string())]);
    }

    #[test]
    fn test_or_inside_and_gets_parens() {
        let q = Expr::path("a")
            .eq(1)
            .or(Expr::path("b").eq(2))
            .and(Expr::path("c").eq(3));
        let (sql, params) = render(&q);
        assert_eq!(sql, "(\"a\" = $1 OR \"b\" = $2) AND \"c\" = $3");
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_in_and_between() {
        let (sql, params) = render(
            &Expr::path("id")
                .in_values(vec![Value::BigInt(1), Value::BigInt(2)])
                .and(Expr::path("year").between(1900, 1950)),
        );
        assert_eq!(
            sql,
            "\"id\" IN ($1, $2) AND \"year\" BETWEEN $3 AND $4"
        );
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn test_case_insensitive_like_falls_back_to_lower() {
        let q = Expr::path("name").ilike("pab%");
        let mut params = Vec::new();
        let sql = q
            .build(Dialect::Sqlite, &mut Bare, &mut params, 0)
            .unwrap();
        assert_eq!(sql, "LOWER(\"name\") LIKE LOWER(?1)");
    }

    #[test]
    fn test_placeholder_offset() {
        let mut params = Vec::new();
        let sql = Expr::path("x")
            .eq(7)
            .build(Dialect::Postgres, &mut Bare, &mut params, 2)
            .unwrap();
        assert_eq!(sql, "\"x\" = $3");
    }

    #[test]
    fn test_paths_collects_every_atom() {
        let q = Expr::path("name")
            .eq("x")
            .and(Expr::path("paintings.title").like("%sun%"))
            .and(Expr::path("paintings.gallery.city").is_null());
        assert_eq!(
            q.paths(),
            vec!["name", "paintings.title", "paintings.gallery.city"]
        );
    }
}
