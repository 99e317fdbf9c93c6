//! Token query compiler.
//!
//! [`EventQuery`] accumulates filters and compiles them into
//! `SELECT * FROM Events WHERE <predicate> ORDER BY <orders> [LIMIT n]` with
//! positional parameters. Each filter reserves a contiguous block of slots in
//! the order it is added, so `$k` numbering is global across the query, never
//! per filter.
//!
//! Token mapping (applied depth-first through `Combined`, all ANDed):
//!
//! | Token                     | Predicate                            |
//! |---------------------------|--------------------------------------|
//! | `UpperBound(p)`           | `position <= p`                      |
//! | `Positional(p)`           | `position > p`                       |
//! | `Bounded { lower, upper }`| `position > lower AND position <= upper` |
//! | `Payload(types)`          | `payloadtype in ( .. )`              |
//! | `AggregateIdentifier(id)` | `aggregateidentifier = id`           |

use std::fmt::Write;

use eventia_core::ResumptionToken;
use rusqlite::types::Value;

use crate::client::Statement;
use crate::errors::{Result, StorageError};

/// Filterable column of the `Events` table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
    /// `Position`
    Position,
    /// `TenantIdentifier`
    TenantIdentifier,
    /// `UserIdentifier`
    UserIdentifier,
    /// `AggregateIdentifier`
    AggregateIdentifier,
    /// `SequenceNumber`
    SequenceNumber,
    /// `PayloadType`
    PayloadType,
}

impl Field {
    /// Column name as written in compiled SQL.
    pub fn column(self) -> &'static str {
        match self {
            Self::Position => "position",
            Self::TenantIdentifier => "tenantidentifier",
            Self::UserIdentifier => "useridentifier",
            Self::AggregateIdentifier => "aggregateidentifier",
            Self::SequenceNumber => "sequencenumber",
            Self::PayloadType => "payloadtype",
        }
    }
}

/// Comparison operator of a filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    /// `=`
    Equal,
    /// `<>`
    NotEqual,
    /// `>`
    Greater,
    /// `>=`
    GreaterEqual,
    /// `<`
    Less,
    /// `<=`
    LessEqual,
    /// `in`
    In,
}

impl Operator {
    /// SQL spelling.
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "<>",
            Self::Greater => ">",
            Self::GreaterEqual => ">=",
            Self::Less => "<",
            Self::LessEqual => "<=",
            Self::In => "in",
        }
    }
}

/// Sort direction on position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ordering {
    /// Oldest first.
    Ascending,
    /// Newest first.
    Descending,
}

#[derive(Clone, Debug)]
struct Filter {
    field: Field,
    operator: Operator,
    slots: Vec<usize>,
}

impl Filter {
    fn build(&self) -> Result<String> {
        let placeholders: Vec<String> = self.slots.iter().map(|slot| format!("${slot}")).collect();
        let operand = match placeholders.as_slice() {
            [] => {
                return Err(StorageError::QueryBuild(format!(
                    "operator \"{}\" on field {} has no slots",
                    self.operator.as_sql(),
                    self.field.column()
                )));
            }
            [single] if self.operator != Operator::In => single.clone(),
            many => format!("( {} )", many.join(" , ")),
        };
        Ok(format!(
            "{} {} {operand}",
            self.field.column(),
            self.operator.as_sql()
        ))
    }
}

/// Event query under construction.
#[derive(Clone, Debug, Default)]
pub struct EventQuery {
    values: Vec<Value>,
    filters: Vec<Filter>,
    orders: Vec<Ordering>,
    limit: Option<u64>,
}

impl EventQuery {
    /// Empty query: every event, ascending by position.
    pub fn new() -> Self {
        Self::default()
    }

    /// Query for a resumption token; `None` reads from the start of the log.
    pub fn from_token(token: Option<&ResumptionToken>) -> Self {
        let mut query = Self::new();
        if let Some(token) = token {
            let _ = query.apply_token(token);
        }
        query
    }

    /// AND the predicate of `token` into the query.
    pub fn apply_token(&mut self, token: &ResumptionToken) -> &mut Self {
        match token {
            ResumptionToken::UpperBound(position) => {
                let _ = self.position().less_equal(*position);
            }
            ResumptionToken::Positional(position) => {
                let _ = self.position().greater(*position);
            }
            ResumptionToken::Bounded { lower, upper } => {
                let _ = self.position().greater(*lower);
                let _ = self.position().less_equal(*upper);
            }
            ResumptionToken::Payload(types) => {
                let _ = self.payload_type().is_in(types.iter().cloned());
            }
            ResumptionToken::AggregateIdentifier(id) => {
                let _ = self.aggregate_identifier().equal(id.clone());
            }
            ResumptionToken::Combined(tokens) => {
                for member in tokens {
                    let _ = self.apply_token(member);
                }
            }
        }
        self
    }

    /// Filter on `Position`.
    pub fn position(&mut self) -> FilterBuilder<'_> {
        self.filter(Field::Position)
    }

    /// Filter on `TenantIdentifier`.
    pub fn tenant_id(&mut self) -> FilterBuilder<'_> {
        self.filter(Field::TenantIdentifier)
    }

    /// Filter on `UserIdentifier`.
    pub fn user_id(&mut self) -> FilterBuilder<'_> {
        self.filter(Field::UserIdentifier)
    }

    /// Filter on `AggregateIdentifier`.
    pub fn aggregate_identifier(&mut self) -> FilterBuilder<'_> {
        self.filter(Field::AggregateIdentifier)
    }

    /// Filter on `SequenceNumber`.
    pub fn sequence_number(&mut self) -> FilterBuilder<'_> {
        self.filter(Field::SequenceNumber)
    }

    /// Filter on `PayloadType`.
    pub fn payload_type(&mut self) -> FilterBuilder<'_> {
        self.filter(Field::PayloadType)
    }

    /// Filter on any field.
    pub fn filter(&mut self, field: Field) -> FilterBuilder<'_> {
        FilterBuilder { query: self, field }
    }

    /// Append an ordering on position. Without one, the query sorts ascending.
    pub fn order_by_position(&mut self, ordering: Ordering) -> &mut Self {
        self.orders.push(ordering);
        self
    }

    /// Cap the number of rows.
    pub fn limit(&mut self, count: u64) -> &mut Self {
        self.limit = Some(count);
        self
    }

    /// Compile to SQL text and parameters.
    pub fn build(&self) -> Result<Statement> {
        let predicate = if self.filters.is_empty() {
            "1=1".to_string()
        } else {
            self.filters
                .iter()
                .map(Filter::build)
                .collect::<Result<Vec<_>>>()?
                .join(" AND ")
        };

        let orders = if self.orders.is_empty() {
            "position ASC".to_string()
        } else {
            self.orders
                .iter()
                .map(|ordering| match ordering {
                    Ordering::Ascending => "position ASC",
                    Ordering::Descending => "position DESC",
                })
                .collect::<Vec<_>>()
                .join(",")
        };

        let mut text = format!("SELECT * FROM Events WHERE {predicate} ORDER BY {orders}");
        if let Some(limit) = self.limit {
            let _ = write!(text, " LIMIT {limit}");
        }

        Ok(Statement::with_values(text, self.values.clone()))
    }
}

/// Binds an operator and values to one field, reserving the next slots.
pub struct FilterBuilder<'a> {
    query: &'a mut EventQuery,
    field: Field,
}

impl<'a> FilterBuilder<'a> {
    /// `field = value`
    pub fn equal(self, value: impl Into<Value>) -> &'a mut EventQuery {
        self.bind(Operator::Equal, [value.into()])
    }

    /// `field <> value`
    pub fn not_equal(self, value: impl Into<Value>) -> &'a mut EventQuery {
        self.bind(Operator::NotEqual, [value.into()])
    }

    /// `field > value`
    pub fn greater(self, value: impl Into<Value>) -> &'a mut EventQuery {
        self.bind(Operator::Greater, [value.into()])
    }

    /// `field >= value`
    pub fn greater_equal(self, value: impl Into<Value>) -> &'a mut EventQuery {
        self.bind(Operator::GreaterEqual, [value.into()])
    }

    /// `field < value`
    pub fn less(self, value: impl Into<Value>) -> &'a mut EventQuery {
        self.bind(Operator::Less, [value.into()])
    }

    /// `field <= value`
    pub fn less_equal(self, value: impl Into<Value>) -> &'a mut EventQuery {
        self.bind(Operator::LessEqual, [value.into()])
    }

    /// `field in ( values )`. An empty set fails at [`EventQuery::build`].
    pub fn is_in<I, V>(self, values: I) -> &'a mut EventQuery
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.bind(Operator::In, values.into_iter().map(Into::into))
    }

    fn bind(self, operator: Operator, values: impl IntoIterator<Item = Value>) -> &'a mut EventQuery {
        let mut slots = Vec::new();
        for value in values {
            self.query.values.push(value);
            slots.push(self.query.values.len());
        }
        self.query.filters.push(Filter {
            field: self.field,
            operator,
            slots,
        });
        self.query
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
