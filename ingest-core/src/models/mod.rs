pub mod column;
pub mod op;

pub use column::{is_valid_identifier, validate_table_base_name, ColumnSpec};
pub use op::ChangeOp;
