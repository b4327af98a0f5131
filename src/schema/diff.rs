use super::{FieldDescriptor, FieldType, IndexDescriptor, TableDescriptor};

/// One structural statement. Rendering to SQL is left to the database facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    CreateTable { table: TableDescriptor },
    AddColumn { table: String, field: FieldDescriptor },
    /// `field` is the full target definition of the column.
    ModifyColumn { table: String, field: FieldDescriptor },
    DropColumn { table: String, column: String },
    AddIndex { table: String, index: IndexDescriptor },
    DropIndex { table: String, index: String },
    ResetSequence { table: String, column: String, next_value: i64 },
}

impl SchemaChange {
    pub fn table(&self) -> &str {
        match self {
            SchemaChange::CreateTable { table } => &table.name,
            SchemaChange::AddColumn { table, .. }
            | SchemaChange::ModifyColumn { table, .. }
            | SchemaChange::DropColumn { table, .. }
            | SchemaChange::AddIndex { table, .. }
            | SchemaChange::DropIndex { table, .. }
            | SchemaChange::ResetSequence { table, .. } => table,
        }
    }
}

pub type AlterScript = Vec<SchemaChange>;

/// Computes the statements that turn `actual` into `expected`, or `None` when
/// nothing needs to change.
///
/// Columns missing in the destination are added. Columns that differ are
/// widened, never narrowed. Destination-only columns are dropped unless they
/// are listed in `preserve_columns` (entries are `column` or `table.column`).
pub fn diff(
    expected: &TableDescriptor,
    actual: Option<&TableDescriptor>,
    preserve_columns: &[String],
) -> Option<AlterScript> {
    let Some(actual) = actual else {
        return Some(vec![SchemaChange::CreateTable {
            table: expected.clone(),
        }]);
    };
    let table = expected.name.clone();
    let mut drops = Vec::new();
    let mut columns = Vec::new();
    let mut adds = Vec::new();

    for index in &actual.indexes {
        if !expected.indexes.iter().any(|e| e.same_shape(index)) {
            drops.push(SchemaChange::DropIndex {
                table: table.clone(),
                index: index.name.clone(),
            });
        }
    }

    for field in &expected.fields {
        match actual.field(&field.name) {
            None => columns.push(SchemaChange::AddColumn {
                table: table.clone(),
                field: field.clone(),
            }),
            Some(current) => {
                let target = widen_field(current, field);
                if &target != current {
                    columns.push(SchemaChange::ModifyColumn {
                        table: table.clone(),
                        field: target,
                    });
                }
            }
        }
    }

    for field in &actual.fields {
        if expected.field(&field.name).is_none() && !is_preserved(&table, &field.name, preserve_columns) {
            columns.push(SchemaChange::DropColumn {
                table: table.clone(),
                column: field.name.clone(),
            });
        }
    }

    for index in &expected.indexes {
        if !actual.indexes.iter().any(|a| a.same_shape(index)) {
            adds.push(SchemaChange::AddIndex {
                table: table.clone(),
                index: index.clone(),
            });
        }
    }

    let script: AlterScript = drops.into_iter().chain(columns).chain(adds).collect();
    if script.is_empty() { None } else { Some(script) }
}

/// Statement that moves the table's sequence past every id that is now present.
///
/// Bulk inserts with explicit ids do not advance the sequence, so the next value
/// must be strictly greater than both the value recorded in the backup and the
/// highest id found after the insert.
pub fn sequence_repair(
    table: &TableDescriptor,
    expected_max: i64,
    actual_max: Option<i64>,
) -> Option<SchemaChange> {
    let field = table.sequence_field()?;
    let highest = expected_max.max(actual_max.unwrap_or(0)).max(0);
    Some(SchemaChange::ResetSequence {
        table: table.name.clone(),
        column: field.name.clone(),
        next_value: highest + 1,
    })
}

fn is_preserved(table: &str, column: &str, preserve_columns: &[String]) -> bool {
    preserve_columns.iter().any(|entry| match entry.split_once('.') {
        Some((t, c)) => t == table && c == column,
        None => entry == column,
    })
}

fn widen_field(actual: &FieldDescriptor, expected: &FieldDescriptor) -> FieldDescriptor {
    FieldDescriptor {
        name: actual.name.clone(),
        field_type: widen(&actual.field_type, &expected.field_type),
        // Relaxing NOT NULL is safe, adding it is not.
        notnull: actual.notnull && expected.notnull,
        default: expected.default.clone(),
        sequence: actual.sequence,
    }
}

fn int_digits(bytes: u8) -> u32 {
    match bytes {
        0..=2 => 5,
        3..=4 => 10,
        _ => 19,
    }
}

/// Smallest type able to hold every value of both `actual` and `expected`.
pub(crate) fn widen(actual: &FieldType, expected: &FieldType) -> FieldType {
    use FieldType::*;
    if actual == expected {
        return actual.clone();
    }
    match (actual, expected) {
        (Int { bytes: a }, Int { bytes: b }) => Int { bytes: (*a).max(*b) },
        (Char { length: a }, Char { length: b }) => Char { length: (*a).max(*b) },
        (Float { bytes: a }, Float { bytes: b }) => Float { bytes: (*a).max(*b) },
        (Number { precision: p1, scale: s1 }, Number { precision: p2, scale: s2 }) => {
            let scale = (*s1).max(*s2);
            let integral = p1.saturating_sub(*s1).max(p2.saturating_sub(*s2));
            Number { precision: integral + scale, scale }
        }
        (Int { bytes }, Number { precision, scale }) | (Number { precision, scale }, Int { bytes }) => {
            let integral = precision.saturating_sub(*scale).max(int_digits(*bytes));
            Number { precision: integral + scale, scale: *scale }
        }
        (Int { .. } | Number { .. }, Float { .. }) | (Float { .. }, Int { .. } | Number { .. }) => {
            Float { bytes: 8 }
        }
        (Date, Timestamp) | (Timestamp, Date) => Timestamp,
        (Date | Timestamp, TimestampTz) | (TimestampTz, Date | Timestamp) => TimestampTz,
        (Binary, _) | (_, Binary) => Binary,
        _ => Text,
    }
}
