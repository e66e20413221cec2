pub mod plan;
pub mod rejection;
pub mod turn;

pub use plan::{
    AggregateFn, Assignment, ChartFragment, ChartKind, ColumnRef, Filter, FilterOp, JoinClause,
    Literal, OrderTerm, PlanStatement, Projection, QUERY_PLAN_SCHEMA_VERSION, QueryPlan,
    RenderedQuery, SelectQuery, TimeBucket, WriteKind, WriteStatement, json_schema, quote_ident,
};
pub use rejection::Rejection;
pub use turn::{
    AttemptOutcome, AttemptRecord, ExecutionResult, FailureKind, Message, MessageRole, Response,
    Turn, TurnFailure, TurnStatus, messages_from_turns,
};
