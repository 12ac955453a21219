pub mod exec;
pub mod expr;
pub mod optimizer;
pub mod pipeline;
pub mod sql_expr;
pub mod stages;
pub mod temp_table;
pub mod tier1;
pub mod values;

pub use exec::{ExecContext, execute_pipeline};
pub use expr::{EvalContext, Expr, eval_expr, parse_expr};
pub use pipeline::{Stage, parse_pipeline};
pub use values::{Numeric, coerce_numeric, json_cmp, values_equal};
