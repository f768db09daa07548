//! Result batch assembly
//!
//! Normalizes raw cursor output into rows of the declared result width.
//! Row sets pass through after a width check; procedure results are padded
//! so the output parameters share the row shape of the result set.

use compact_str::CompactString;
use qore_core::{
    Command, EngineError, EngineResult, ExecutionKind, OutputParameters, Request, Row, Value,
};

/// Shapes the rows of one request.
#[derive(Debug)]
pub struct BatchAssembler {
    kind: ExecutionKind,
    call: String,
    result_columns: usize,
    out_parameters: Vec<CompactString>,
    parameters_emitted: bool,
}

impl BatchAssembler {
    pub fn for_request(request: &Request) -> Self {
        let (result_columns, out_parameters) = match &request.command {
            Command::Query { columns, .. } => (columns.len(), Vec::new()),
            Command::Procedure {
                columns,
                out_parameters,
                ..
            } => (
                columns.len(),
                out_parameters.iter().map(|p| p.name.clone()).collect(),
            ),
            Command::Update { .. } => (1, Vec::new()),
        };

        Self {
            kind: request.command.kind(),
            call: request.command.text().to_string(),
            result_columns,
            out_parameters,
            parameters_emitted: false,
        }
    }

    pub fn kind(&self) -> ExecutionKind {
        self.kind
    }

    /// Width of every row this assembler emits.
    pub fn width(&self) -> usize {
        self.result_columns + self.out_parameters.len()
    }

    /// Validates one cursor row and widens it to the emitted shape.
    pub fn assemble_row(&self, row: Row) -> EngineResult<Row> {
        match self.kind {
            ExecutionKind::RowSet | ExecutionKind::Update => {
                if row.width() != self.result_columns {
                    return Err(EngineError::ColumnCountMismatch {
                        expected: self.result_columns,
                        actual: row.width(),
                    });
                }
                Ok(row)
            }
            ExecutionKind::Procedure => self.pad_row(row),
        }
    }

    fn pad_row(&self, row: Row) -> EngineResult<Row> {
        if row.width() != self.result_columns {
            return Err(EngineError::shape_mismatch(format!(
                "Could not process stored procedure results for {}. Expected {} result set columns, but was {}. Please update your models to allow for stored procedure results batching.",
                self.call,
                self.result_columns,
                row.width()
            )));
        }
        if self.out_parameters.is_empty() {
            return Ok(row);
        }

        let mut values = row.values;
        values.reserve(self.out_parameters.len());
        values.extend(std::iter::repeat(Value::Null).take(self.out_parameters.len()));
        Ok(Row::new(values))
    }

    /// True while the trailing parameter row is still owed.
    pub fn wants_output_parameters(&self) -> bool {
        self.kind == ExecutionKind::Procedure
            && !self.out_parameters.is_empty()
            && !self.parameters_emitted
    }

    /// Builds the row carrying output-parameter values, at most once.
    ///
    /// Result-set positions are null; parameters follow in declared order.
    /// A parameter missing from `values` is reported as null.
    pub fn parameter_row(&mut self, values: &OutputParameters) -> Option<Row> {
        if !self.wants_output_parameters() {
            return None;
        }
        self.parameters_emitted = true;

        let mut row: Vec<Value> = vec![Value::Null; self.result_columns];
        row.extend(
            self.out_parameters
                .iter()
                .map(|name| values.get(name.as_str()).cloned().unwrap_or(Value::Null)),
        );
        Some(Row::new(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qore_core::{ColumnInfo, QueryId, RequestId, SessionId};

    fn request(command: Command) -> Request {
        Request::new(
            RequestId::new(SessionId::new(), QueryId::new(), 0),
            "source",
            command,
        )
    }

    fn sp_test8() -> Request {
        request(Command::Procedure {
            call: "EXEC spTest8(1)".to_string(),
            columns: vec![ColumnInfo::new("a", "integer"), ColumnInfo::new("b", "string")],
            out_parameters: vec![ColumnInfo::new("r", "integer")],
        })
    }

    #[test]
    fn test_procedure_row_is_padded() {
        let assembler = BatchAssembler::for_request(&sp_test8());
        assert_eq!(assembler.width(), 3);

        let row = assembler
            .assemble_row(Row::new(vec![Value::Null, Value::Null]))
            .expect("width 2 should be accepted");
        assert_eq!(row.width(), 3);
        assert_eq!(row.values[2], Value::Null);
    }

    #[test]
    fn test_procedure_parameter_row() {
        let mut assembler = BatchAssembler::for_request(&sp_test8());
        let mut params = OutputParameters::new();
        params.insert("r".to_string(), Value::Int(0));

        let row = assembler.parameter_row(&params).expect("parameter row");
        assert_eq!(row.values, vec![Value::Null, Value::Null, Value::Int(0)]);

        // emitted once only
        assert!(assembler.parameter_row(&params).is_none());
    }

    #[test]
    fn test_procedure_width_mismatch_names_the_call() {
        let assembler = BatchAssembler::for_request(&sp_test8());
        let err = assembler
            .assemble_row(Row::new(vec![Value::Int(1)]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Could not process stored procedure results for EXEC spTest8(1). Expected 2 result set columns, but was 1. Please update your models to allow for stored procedure results batching."
        );
    }

    #[test]
    fn test_output_only_call_yields_single_row() {
        let mut assembler = BatchAssembler::for_request(&request(Command::Procedure {
            call: "EXEC spOut()".to_string(),
            columns: vec![],
            out_parameters: vec![ColumnInfo::new("x", "integer"), ColumnInfo::new("y", "string")],
        }));
        let mut params = OutputParameters::new();
        params.insert("y".to_string(), Value::Text("done".to_string()));

        let row = assembler.parameter_row(&params).expect("parameter row");
        assert_eq!(row.values, vec![Value::Null, Value::Text("done".to_string())]);
    }

    #[test]
    fn test_row_set_passes_through_and_checks_width() {
        let assembler = BatchAssembler::for_request(&request(Command::Query {
            sql: "SELECT a FROM t".to_string(),
            columns: vec![ColumnInfo::new("a", "integer")],
        }));
        let row = Row::new(vec![Value::Int(7)]);
        assert_eq!(assembler.assemble_row(row.clone()).unwrap(), row);

        let err = assembler
            .assemble_row(Row::new(vec![Value::Int(7), Value::Int(8)]))
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::ColumnCountMismatch {
                expected: 1,
                actual: 2
            }
        );
        assert!(!assembler.wants_output_parameters());
    }

    #[test]
    fn test_update_count_row() {
        let assembler = BatchAssembler::for_request(&request(Command::Update {
            sql: "DELETE FROM t".to_string(),
        }));
        assert_eq!(assembler.kind(), ExecutionKind::Update);
        assert!(assembler.assemble_row(Row::new(vec![Value::Int(4)])).is_ok());
    }
}
