//! Schema reconciliation: logical schema vs. physical storage.
//!
//! Only additive changes are ever applied. Missing tables are created with
//! their full column set; existing tables are extended with nullable columns.
//! Existing columns are never dropped or retyped.

use std::collections::{HashMap, HashSet};

use landfall_types::capabilities::Capability;
use landfall_types::error::{DestinationError, Result};
use landfall_types::naming::normalize_identifier;
use landfall_types::schema::{
    ColumnDef, DataType, LogicalSchema, LogicalTable, LOADS_TABLE, STATE_TABLE, VERSION_TABLE,
};
use landfall_types::DestinationCapabilities;

use crate::error::StoreResultExt;
use crate::settings::DestinationSettings;
use crate::store::{NativeColumn, TableStore};
use crate::type_mapper::TypeMapper;

const BOOKKEEPING_TABLES: [&str; 3] = [VERSION_TABLE, LOADS_TABLE, STATE_TABLE];

/// Engine-managed column added next to the logical ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedField {
    /// Synthetic text row id.
    Id,
    /// Embedding vector.
    Vector,
}

/// Changes needed for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDelta {
    pub table: String,
    pub physical_name: String,
    /// `false` when the table must be created.
    pub exists: bool,
    /// Logical columns to create or add, keyed by their physical name.
    pub new_columns: Vec<(String, ColumnDef)>,
    pub derived: Vec<DerivedField>,
}

/// Minimal set of new tables and columns aligning storage with a schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaDelta {
    pub tables: Vec<TableDelta>,
}

impl SchemaDelta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Logical names of tables that do not exist yet.
    pub fn new_tables(&self) -> impl Iterator<Item = &str> {
        self.tables
            .iter()
            .filter(|t| !t.exists)
            .map(|t| t.table.as_str())
    }

    /// Logical columns the delta adds to `table`.
    #[must_use]
    pub fn new_columns(&self, table: &str) -> Vec<&ColumnDef> {
        self.tables
            .iter()
            .find(|t| t.table == table)
            .map(|t| t.new_columns.iter().map(|(_, c)| c).collect())
            .unwrap_or_default()
    }
}

/// Diff one table against the physical column names found in storage.
///
/// `physical` is `None` when the table does not exist.
///
/// # Errors
///
/// Returns a `schema` error when two logical columns normalize to the same
/// physical name or a logical column collides with an engine-managed one.
pub fn diff_table(
    table: &LogicalTable,
    physical_name: &str,
    physical: Option<&[String]>,
    caps: &DestinationCapabilities,
    settings: &DestinationSettings,
    with_vector: bool,
) -> Result<Option<TableDelta>> {
    let internal = LogicalSchema::is_internal(&table.name);
    let mut seen: HashMap<String, &str> = HashMap::new();
    let mut normalized = Vec::with_capacity(table.columns.len());
    for column in table.columns.values() {
        let name = normalize_identifier(&column.name, caps);
        if let Some(other) = seen.insert(name.clone(), &column.name) {
            return Err(DestinationError::schema(
                "AMBIGUOUS_COLUMN",
                format!(
                    "columns '{other}' and '{}' both normalize to '{name}'",
                    column.name
                ),
            )
            .with_table(&table.name));
        }
        if !internal && settings.is_derived_column(&name) {
            return Err(DestinationError::schema(
                "RESERVED_COLUMN",
                format!("column '{}' collides with an engine-managed column", column.name),
            )
            .with_table(&table.name));
        }
        normalized.push((name, column));
    }

    let existing: HashSet<&str> = physical
        .unwrap_or_default()
        .iter()
        .map(String::as_str)
        .collect();
    let new_columns: Vec<(String, ColumnDef)> = normalized
        .into_iter()
        .filter(|(name, _)| !existing.contains(name.as_str()))
        .map(|(name, column)| (name, column.clone()))
        .collect();

    let mut derived = Vec::new();
    if !internal {
        if !existing.contains(settings.id_field_name.as_str()) {
            derived.push(DerivedField::Id);
        }
        if with_vector
            && !table.vectorize_columns().is_empty()
            && !existing.contains(settings.vector_field_name.as_str())
        {
            derived.push(DerivedField::Vector);
        }
    }

    let exists = physical.is_some();
    if exists && new_columns.is_empty() && derived.is_empty() {
        return Ok(None);
    }
    Ok(Some(TableDelta {
        table: table.name.clone(),
        physical_name: physical_name.to_string(),
        exists,
        new_columns,
        derived,
    }))
}

/// Computes and applies [`SchemaDelta`]s against one store.
pub struct SchemaDiffEngine<'a, S, M> {
    store: &'a S,
    mapper: &'a M,
    settings: &'a DestinationSettings,
    vector_dimensions: Option<usize>,
}

impl<'a, S, M> SchemaDiffEngine<'a, S, M>
where
    S: TableStore,
    M: TypeMapper<Native = S::Native>,
{
    /// `vector_dimensions` is set when an embedding strategy is configured.
    pub fn new(
        store: &'a S,
        mapper: &'a M,
        settings: &'a DestinationSettings,
        vector_dimensions: Option<usize>,
    ) -> Self {
        let vector_dimensions =
            vector_dimensions.filter(|_| mapper.capabilities().has(Capability::Embeddings));
        Self {
            store,
            mapper,
            settings,
            vector_dimensions,
        }
    }

    /// Diff every table in scope (all tables, or `only_tables`) against storage.
    ///
    /// The bookkeeping tables are always in scope, so the version row written
    /// after a partial upgrade has somewhere to go.
    ///
    /// # Errors
    ///
    /// Transient when the store cannot be introspected; `schema` on ambiguous
    /// names; `config` when `only_tables` names a table the schema lacks.
    pub async fn reconcile(
        &self,
        schema: &LogicalSchema,
        only_tables: Option<&[String]>,
    ) -> Result<SchemaDelta> {
        let caps = self.mapper.capabilities();
        let tables: Vec<&LogicalTable> = match only_tables {
            None => schema.tables.values().collect(),
            Some(names) => BOOKKEEPING_TABLES
                .iter()
                .map(|name| (*name).to_string())
                .chain(names.iter().filter(|n| !LogicalSchema::is_internal(n)).cloned())
                .map(|name| {
                    schema.get_table(&name).ok_or_else(|| {
                        DestinationError::config(
                            "UNKNOWN_TABLE",
                            format!("table '{name}' is not in schema '{}'", schema.name),
                        )
                        .with_table(&name)
                    })
                })
                .collect::<Result<_>>()?,
        };

        let mut delta = SchemaDelta::default();
        for table in tables {
            let physical_name = self.settings.qualified_table_name(caps, &table.name);
            let physical = self
                .store
                .describe_table(&physical_name)
                .await
                .for_table(&table.name)?;
            let physical_names: Option<Vec<String>> =
                physical.map(|cols| cols.into_iter().map(|c| c.name).collect());
            if let Some(table_delta) = diff_table(
                table,
                &physical_name,
                physical_names.as_deref(),
                caps,
                self.settings,
                self.vector_dimensions.is_some(),
            )? {
                tracing::info!(
                    table = %table.name,
                    exists = table_delta.exists,
                    new_columns = table_delta.new_columns.len(),
                    derived = table_delta.derived.len(),
                    "schema delta computed"
                );
                delta.tables.push(table_delta);
            }
        }
        Ok(delta)
    }

    /// Create missing tables and add missing columns.
    ///
    /// # Errors
    ///
    /// Propagates store failures translated into the destination taxonomy.
    pub async fn apply(&self, delta: &SchemaDelta) -> Result<()> {
        for table_delta in &delta.tables {
            let columns = self.native_columns(table_delta)?;
            if table_delta.exists {
                self.store
                    .add_columns(&table_delta.physical_name, &columns)
                    .await
                    .for_table(&table_delta.table)?;
                tracing::info!(
                    table = %table_delta.physical_name,
                    columns = columns.len(),
                    "extended table with nullable columns"
                );
            } else {
                self.store
                    .create_table(&table_delta.physical_name, &columns)
                    .await
                    .for_table(&table_delta.table)?;
                tracing::info!(
                    table = %table_delta.physical_name,
                    columns = columns.len(),
                    "created table"
                );
            }
        }
        Ok(())
    }

    fn native_columns(&self, table_delta: &TableDelta) -> Result<Vec<NativeColumn<S::Native>>> {
        let mut columns = Vec::with_capacity(table_delta.new_columns.len() + 2);
        for (physical, column) in &table_delta.new_columns {
            let native = self
                .mapper
                .to_destination_type(column)
                .map_err(|e| e.with_table(&table_delta.table))?;
            // Columns added to existing tables must be nullable.
            let nullable = table_delta.exists || column.nullable;
            columns.push(
                NativeColumn::new(physical.clone(), native)
                    .with_nullable(nullable)
                    .with_unique(column.hints.unique),
            );
        }
        for derived in &table_delta.derived {
            match derived {
                DerivedField::Id => {
                    let id = ColumnDef::new(self.settings.id_field_name.clone(), DataType::Text);
                    columns.push(NativeColumn::new(
                        self.settings.id_field_name.clone(),
                        self.mapper.to_destination_type(&id)?,
                    ));
                }
                DerivedField::Vector => {
                    let Some(dims) = self.vector_dimensions else {
                        continue;
                    };
                    let native = self.mapper.vector_type(dims).ok_or_else(|| {
                        DestinationError::config(
                            "VECTOR_UNSUPPORTED",
                            "destination declares embeddings but has no vector column type",
                        )
                    })?;
                    columns.push(NativeColumn::new(self.settings.vector_field_name.clone(), native));
                }
            }
        }
        Ok(columns)
    }

    /// Introspect a table as logical columns, skipping engine-managed ones.
    ///
    /// # Errors
    ///
    /// Transient on store failure; `schema` for native types with no logical mapping.
    pub async fn storage_table(&self, table: &str) -> Result<Option<Vec<ColumnDef>>> {
        let caps = self.mapper.capabilities();
        let physical_name = self.settings.qualified_table_name(caps, table);
        let Some(columns) = self
            .store
            .describe_table(&physical_name)
            .await
            .for_table(table)?
        else {
            return Ok(None);
        };
        let mut out = Vec::with_capacity(columns.len());
        for column in columns {
            if self.settings.is_derived_column(&column.name) {
                continue;
            }
            let ty = self
                .mapper
                .from_destination_type(&column.native)
                .map_err(|e| e.with_table(table))?;
            let mut def = ColumnDef::from_type(column.name, ty, column.nullable);
            def.hints.unique = column.unique;
            out.push(def);
        }
        Ok(Some(out))
    }
}
