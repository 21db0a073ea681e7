// ============================================================================
// src/parser/adapter.rs - raw SQL guard on top of sqlparser
// ============================================================================
//
// Accepts exactly one SELECT / INSERT / UPDATE / DELETE statement over a
// single table. Every value must come from a `$n` binding: inline string and
// numeric literals are rejected (numbers are tolerated in LIMIT / OFFSET), as
// are unused bindings and placeholders without a binding.
//
// ============================================================================

use crate::core::{DbError, Result, Value};
use crate::parser::ast::*;
use sqlparser::ast as sql_ast;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

pub struct RawSqlGuard {
    dialect: PostgreSqlDialect,
}

impl RawSqlGuard {
    pub fn new() -> Self {
        Self {
            dialect: PostgreSqlDialect {},
        }
    }

    pub fn bind(&self, sql: &str, bindings: &[Value]) -> Result<RawQuery> {
        let mut stmts = Parser::parse_sql(&self.dialect, sql)
            .map_err(|e| DbError::Validation(format!("Invalid SQL: {}", e)))?;

        if stmts.len() != 1 {
            return Err(DbError::Validation(format!(
                "Expected exactly one statement, got {}",
                stmts.len()
            )));
        }
        let Some(stmt) = stmts.pop() else {
            return Err(DbError::Validation("Empty statement".into()));
        };

        let mut binder = Binder::new(bindings);
        let statement = binder.convert_statement(stmt)?;
        binder.finish()?;

        Ok(RawQuery {
            sql: sql.to_string(),
            bindings: bindings.to_vec(),
            statement,
        })
    }
}

impl Default for RawSqlGuard {
    fn default() -> Self {
        Self::new()
    }
}

struct Binder<'a> {
    bindings: &'a [Value],
    used: Vec<bool>,
}

impl<'a> Binder<'a> {
    fn new(bindings: &'a [Value]) -> Self {
        Self {
            bindings,
            used: vec![false; bindings.len()],
        }
    }

    fn finish(&self) -> Result<()> {
        match self.used.iter().position(|used| !used) {
            Some(idx) => Err(DbError::Validation(format!(
                "Binding ${} is never referenced",
                idx + 1
            ))),
            None => Ok(()),
        }
    }

    fn placeholder(&mut self, raw: &str) -> Result<Value> {
        let position = raw
            .strip_prefix('$')
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|n| *n >= 1)
            .ok_or_else(|| {
                DbError::Validation(format!(
                    "Unsupported placeholder '{}', use $1, $2, ...",
                    raw
                ))
            })?;

        let value = self.bindings.get(position - 1).ok_or_else(|| {
            DbError::Validation(format!(
                "Placeholder {} has no binding ({} provided)",
                raw,
                self.bindings.len()
            ))
        })?;
        self.used[position - 1] = true;
        Ok(value.clone())
    }

    fn convert_statement(&mut self, stmt: sql_ast::Statement) -> Result<BoundStatement> {
        match stmt {
            sql_ast::Statement::Query(query) => self.convert_query(*query),
            sql_ast::Statement::Insert(insert) => self.convert_insert(insert),
            sql_ast::Statement::Update {
                table,
                assignments,
                selection,
                ..
            } => self.convert_update(table, assignments, selection),
            sql_ast::Statement::Delete(delete) => self.convert_delete(delete),
            other => Err(DbError::Validation(format!(
                "Statement not allowed in raw queries: {}",
                statement_keyword(&other)
            ))),
        }
    }

    fn convert_query(&mut self, query: sql_ast::Query) -> Result<BoundStatement> {
        if query.with.is_some() {
            return Err(DbError::Validation("WITH clauses are not supported".into()));
        }
        let sql_ast::SetExpr::Select(select) = *query.body else {
            return Err(DbError::Validation(
                "Only plain SELECT queries are supported".into(),
            ));
        };
        let select = *select;

        if select.from.len() != 1 || !select.from[0].joins.is_empty() {
            return Err(DbError::Validation(
                "Raw queries must read from exactly one table".into(),
            ));
        }
        if select.having.is_some() {
            return Err(DbError::Validation("HAVING is not supported".into()));
        }
        match &select.group_by {
            sql_ast::GroupByExpr::Expressions(exprs, _) if exprs.is_empty() => {}
            _ => return Err(DbError::Validation("GROUP BY is not supported".into())),
        }

        let table = table_factor_name(&select.from[0].relation)?;
        let projection = self.convert_projection(select.projection)?;
        let filter = select
            .selection
            .as_ref()
            .map(|expr| self.convert_condition(expr))
            .transpose()?;
        let order = convert_order_by(query.order_by)?;
        let (limit, offset) = self.convert_limit_clause(query.limit_clause.as_ref())?;

        Ok(BoundStatement::Select {
            table,
            projection,
            filter,
            order,
            limit,
            offset,
        })
    }

    fn convert_projection(&mut self, items: Vec<sql_ast::SelectItem>) -> Result<Projection> {
        let total = items.len();
        let mut columns = Vec::with_capacity(total);
        let mut count = false;

        for item in items {
            match item {
                sql_ast::SelectItem::Wildcard(_) => {
                    if total != 1 {
                        return Err(DbError::Validation(
                            "'*' cannot be combined with other columns".into(),
                        ));
                    }
                    return Ok(Projection::All);
                }
                sql_ast::SelectItem::UnnamedExpr(sql_ast::Expr::Function(func))
                    if func.name.to_string().eq_ignore_ascii_case("count") =>
                {
                    count = true;
                }
                sql_ast::SelectItem::UnnamedExpr(expr) => columns.push(column_name(&expr)?),
                _ => {
                    return Err(DbError::Validation(
                        "Aliased select items are not supported".into(),
                    ));
                }
            }
        }

        match (count, columns.is_empty()) {
            (true, true) => Ok(Projection::Count),
            (true, false) => Err(DbError::Validation(
                "COUNT(*) cannot be combined with other columns".into(),
            )),
            (false, _) => Ok(Projection::Columns(columns)),
        }
    }

    fn convert_limit_clause(
        &mut self,
        clause: Option<&sql_ast::LimitClause>,
    ) -> Result<(Option<usize>, usize)> {
        let Some(clause) = clause else {
            return Ok((None, 0));
        };

        match clause {
            sql_ast::LimitClause::LimitOffset { limit, offset, .. } => {
                let limit = limit.as_ref().map(|e| self.convert_count(e)).transpose()?;
                let offset = match offset {
                    Some(offset) => self.convert_count(&offset.value)?,
                    None => 0,
                };
                Ok((limit, offset))
            }
            sql_ast::LimitClause::OffsetCommaLimit { offset, limit } => {
                let offset = self.convert_count(offset)?;
                let limit = self.convert_count(limit)?;
                Ok((Some(limit), offset))
            }
        }
    }

    fn convert_count(&mut self, expr: &sql_ast::Expr) -> Result<usize> {
        let value = match expr {
            sql_ast::Expr::Value(v) => match &v.value {
                sql_ast::Value::Number(n, _) => {
                    return n.parse::<usize>().map_err(|_| {
                        DbError::Validation(format!("Invalid LIMIT/OFFSET value: {}", n))
                    });
                }
                sql_ast::Value::Placeholder(p) => self.placeholder(p)?,
                other => {
                    return Err(DbError::Validation(format!(
                        "Invalid LIMIT/OFFSET value: {}",
                        other
                    )));
                }
            },
            _ => {
                return Err(DbError::Validation(
                    "LIMIT/OFFSET must be a number or a binding".into(),
                ));
            }
        };

        match value.as_i64() {
            Some(n) if n >= 0 => Ok(n as usize),
            _ => Err(DbError::Validation(format!(
                "LIMIT/OFFSET binding must be a non-negative integer, got {}",
                value
            ))),
        }
    }

    fn convert_insert(&mut self, insert: sql_ast::Insert) -> Result<BoundStatement> {
        let table = insert.table.to_string();

        let columns = if insert.columns.is_empty() {
            None
        } else {
            Some(insert.columns.into_iter().map(|id| id.value).collect())
        };

        let Some(source) = insert.source else {
            return Err(DbError::Validation("INSERT requires a VALUES clause".into()));
        };
        let sql_ast::SetExpr::Values(vals) = *source.body else {
            return Err(DbError::Validation("Only INSERT ... VALUES is supported".into()));
        };

        let rows = vals
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|expr| self.convert_operand(expr))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(BoundStatement::Insert {
            table,
            columns,
            rows,
        })
    }

    fn convert_update(
        &mut self,
        table: sql_ast::TableWithJoins,
        assignments: Vec<sql_ast::Assignment>,
        selection: Option<sql_ast::Expr>,
    ) -> Result<BoundStatement> {
        let table = table_factor_name(&table.relation)?;

        let assignments = assignments
            .into_iter()
            .map(|assign| {
                let column = match assign.target {
                    sql_ast::AssignmentTarget::ColumnName(col_name) if col_name.0.len() == 1 => {
                        col_name.0[0].to_string()
                    }
                    _ => {
                        return Err(DbError::Validation(
                            "Only simple column names are supported in UPDATE".into(),
                        ));
                    }
                };
                let value = self.convert_operand(&assign.value)?;
                Ok((column, value))
            })
            .collect::<Result<Vec<_>>>()?;

        let filter = selection
            .as_ref()
            .map(|expr| self.convert_condition(expr))
            .transpose()?;

        Ok(BoundStatement::Update {
            table,
            assignments,
            filter,
        })
    }

    fn convert_delete(&mut self, delete: sql_ast::Delete) -> Result<BoundStatement> {
        let tables = match &delete.from {
            sql_ast::FromTable::WithFromKeyword(tables)
            | sql_ast::FromTable::WithoutKeyword(tables) => tables,
        };
        if tables.len() != 1 {
            return Err(DbError::Validation(
                "DELETE must target exactly one table".into(),
            ));
        }
        let table = table_factor_name(&tables[0].relation)?;

        let filter = delete
            .selection
            .as_ref()
            .map(|expr| self.convert_condition(expr))
            .transpose()?;

        Ok(BoundStatement::Delete { table, filter })
    }

    fn convert_condition(&mut self, expr: &sql_ast::Expr) -> Result<Condition> {
        match expr {
            sql_ast::Expr::Nested(inner) => self.convert_condition(inner),
            sql_ast::Expr::BinaryOp { left, op, right } => match op {
                sql_ast::BinaryOperator::And => Ok(Condition::And(
                    Box::new(self.convert_condition(left)?),
                    Box::new(self.convert_condition(right)?),
                )),
                sql_ast::BinaryOperator::Or => Ok(Condition::Or(
                    Box::new(self.convert_condition(left)?),
                    Box::new(self.convert_condition(right)?),
                )),
                _ => {
                    let op = compare_op(op)?;
                    let column = column_name(left)?;
                    let value = self.convert_operand(right)?;
                    Ok(Condition::Compare { column, op, value })
                }
            },
            sql_ast::Expr::UnaryOp {
                op: sql_ast::UnaryOperator::Not,
                expr,
            } => Ok(Condition::Not(Box::new(self.convert_condition(expr)?))),
            sql_ast::Expr::InList {
                expr,
                list,
                negated,
            } => {
                let column = column_name(expr)?;
                let values = list
                    .iter()
                    .map(|item| self.convert_operand(item))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Condition::In {
                    column,
                    values,
                    negated: *negated,
                })
            }
            sql_ast::Expr::Like {
                negated,
                expr,
                pattern,
                ..
            } => self.convert_like(expr, pattern, *negated, false),
            sql_ast::Expr::ILike {
                negated,
                expr,
                pattern,
                ..
            } => self.convert_like(expr, pattern, *negated, true),
            sql_ast::Expr::IsNull(inner) => Ok(Condition::IsNull {
                column: column_name(inner)?,
                negated: false,
            }),
            sql_ast::Expr::IsNotNull(inner) => Ok(Condition::IsNull {
                column: column_name(inner)?,
                negated: true,
            }),
            other => Err(DbError::Validation(format!(
                "Unsupported condition: {}",
                other
            ))),
        }
    }

    fn convert_like(
        &mut self,
        expr: &sql_ast::Expr,
        pattern: &sql_ast::Expr,
        negated: bool,
        case_insensitive: bool,
    ) -> Result<Condition> {
        let column = column_name(expr)?;
        let pattern = match self.convert_operand(pattern)? {
            Value::Text(text) => text,
            other => {
                return Err(DbError::Validation(format!(
                    "LIKE pattern must be text, got {}",
                    other.type_name()
                )));
            }
        };
        Ok(Condition::Like {
            column,
            pattern,
            negated,
            case_insensitive,
        })
    }

    fn convert_operand(&mut self, expr: &sql_ast::Expr) -> Result<Value> {
        match expr {
            sql_ast::Expr::Nested(inner) => self.convert_operand(inner),
            sql_ast::Expr::Value(v) => match &v.value {
                sql_ast::Value::Placeholder(p) => self.placeholder(p),
                sql_ast::Value::Null => Ok(Value::Null),
                sql_ast::Value::Boolean(b) => Ok(Value::Boolean(*b)),
                other => Err(DbError::Validation(format!(
                    "Inline literal {} is not allowed, pass it as a binding",
                    other
                ))),
            },
            other => Err(DbError::Validation(format!(
                "Unsupported value expression: {}",
                other
            ))),
        }
    }
}

fn convert_order_by(order_by: Option<sql_ast::OrderBy>) -> Result<Vec<SortKey>> {
    let Some(order_by) = order_by else {
        return Ok(Vec::new());
    };

    match order_by.kind {
        sql_ast::OrderByKind::Expressions(exprs) => exprs
            .into_iter()
            .map(|order| {
                Ok(SortKey {
                    column: column_name(&order.expr)?,
                    descending: order.options.asc.map(|asc| !asc).unwrap_or(false),
                })
            })
            .collect(),
        sql_ast::OrderByKind::All(_) => {
            Err(DbError::Validation("ORDER BY ALL is not supported".into()))
        }
    }
}

fn compare_op(op: &sql_ast::BinaryOperator) -> Result<CompareOp> {
    match op {
        sql_ast::BinaryOperator::Eq => Ok(CompareOp::Eq),
        sql_ast::BinaryOperator::NotEq => Ok(CompareOp::NotEq),
        sql_ast::BinaryOperator::Lt => Ok(CompareOp::Lt),
        sql_ast::BinaryOperator::LtEq => Ok(CompareOp::LtEq),
        sql_ast::BinaryOperator::Gt => Ok(CompareOp::Gt),
        sql_ast::BinaryOperator::GtEq => Ok(CompareOp::GtEq),
        other => Err(DbError::Validation(format!(
            "Unsupported operator: {}",
            other
        ))),
    }
}

fn column_name(expr: &sql_ast::Expr) -> Result<String> {
    match expr {
        sql_ast::Expr::Identifier(ident) => Ok(ident.value.clone()),
        sql_ast::Expr::CompoundIdentifier(idents) => idents
            .last()
            .map(|ident| ident.value.clone())
            .ok_or_else(|| DbError::Validation("Empty column reference".into())),
        other => Err(DbError::Validation(format!(
            "Expected a column name, got {}",
            other
        ))),
    }
}

fn table_factor_name(factor: &sql_ast::TableFactor) -> Result<String> {
    match factor {
        sql_ast::TableFactor::Table { name, .. } => extract_table_name(name),
        _ => Err(DbError::Validation(
            "Only plain table references are supported".into(),
        )),
    }
}

fn extract_table_name(name: &sql_ast::ObjectName) -> Result<String> {
    name.0
        .last()
        .map(|ident| ident.to_string())
        .ok_or_else(|| DbError::Validation("Invalid table name".into()))
}

fn statement_keyword(stmt: &sql_ast::Statement) -> String {
    stmt.to_string()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}

// ============================================================================
// TESTS
// ============================================================================
