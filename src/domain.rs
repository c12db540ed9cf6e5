use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::ImportError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: i64,
    pub short_code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub id: i64,
    pub short_code: String,
    pub name: String,
    pub region_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntermediateRegion {
    pub id: i64,
    pub name: String,
    pub state_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImmediateRegion {
    pub id: i64,
    pub name: String,
    pub intermediate_region_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mesoregion {
    pub id: i64,
    pub name: String,
    pub state_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Microregion {
    pub id: i64,
    pub name: String,
    pub mesoregion_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Municipality {
    pub id: i64,
    pub name: String,
    pub microregion_id: Option<i64>,
    pub immediate_region_id: Option<i64>,
}

/// A district with every ancestor key copied from its municipality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct District {
    pub id: i64,
    pub name: String,
    pub municipality_id: i64,
    pub microregion_id: i64,
    pub mesoregion_id: i64,
    pub state_id: i64,
    pub region_id: i64,
    pub immediate_region_id: i64,
    pub intermediate_region_id: i64,
}

/// One row of the Receita Federal "Empresas" file, keyed by base CNPJ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub base_cnpj: i32,
    pub legal_name: String,
    pub legal_nature: i32,
    pub responsible_qualification: i32,
    pub capital: i32,
    pub size_class: i32,
    pub federative_entity: Option<String>,
}

/// Which geography endpoints an import run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ImportTarget {
    Estados,
    Municipios,
    Distritos,
    Todos,
}

impl ImportTarget {
    pub fn includes_states(self) -> bool {
        matches!(self, ImportTarget::Estados | ImportTarget::Todos)
    }

    pub fn includes_municipalities(self) -> bool {
        matches!(self, ImportTarget::Municipios | ImportTarget::Todos)
    }

    pub fn includes_districts(self) -> bool {
        matches!(self, ImportTarget::Distritos | ImportTarget::Todos)
    }
}

impl fmt::Display for ImportTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportTarget::Estados => write!(f, "estados"),
            ImportTarget::Municipios => write!(f, "municipios"),
            ImportTarget::Distritos => write!(f, "distritos"),
            ImportTarget::Todos => write!(f, "todos"),
        }
    }
}

/// Every table the importer owns, in dependency order (parents first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Regions,
    States,
    IntermediateRegions,
    ImmediateRegions,
    Mesoregions,
    Microregions,
    Municipalities,
    Districts,
    Companies,
}

impl Table {
    pub const ALL: [Table; 9] = [
        Table::Regions,
        Table::States,
        Table::IntermediateRegions,
        Table::ImmediateRegions,
        Table::Mesoregions,
        Table::Microregions,
        Table::Municipalities,
        Table::Districts,
        Table::Companies,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::Regions => "regions",
            Table::States => "states",
            Table::IntermediateRegions => "intermediate_regions",
            Table::ImmediateRegions => "immediate_regions",
            Table::Mesoregions => "mesoregions",
            Table::Microregions => "microregions",
            Table::Municipalities => "municipalities",
            Table::Districts => "districts",
            Table::Companies => "companies",
        }
    }

    pub fn group(self) -> TableGroup {
        match self {
            Table::Companies => TableGroup::Empresas,
            _ => TableGroup::Ibge,
        }
    }

    /// Resolves a model name (`Uf`, `Municipio`, ...) or a table name inside an app.
    pub fn resolve(group: TableGroup, model: &str) -> Result<Table, ImportError> {
        let normalized = model.trim().to_ascii_lowercase();
        let table = match normalized.as_str() {
            "regiao" | "regions" => Some(Table::Regions),
            "uf" | "estado" | "states" => Some(Table::States),
            "regiaointermediaria" | "intermediate_regions" => Some(Table::IntermediateRegions),
            "regiaoimediata" | "immediate_regions" => Some(Table::ImmediateRegions),
            "mesorregiao" | "mesoregions" => Some(Table::Mesoregions),
            "microrregiao" | "microregions" => Some(Table::Microregions),
            "municipio" | "municipalities" => Some(Table::Municipalities),
            "distrito" | "districts" => Some(Table::Districts),
            "empresa" | "companies" => Some(Table::Companies),
            _ => None,
        };
        table
            .filter(|table| table.group() == group)
            .ok_or_else(|| ImportError::UnknownTable {
                app: group.to_string(),
                model: model.to_string(),
            })
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Logical group of tables, mirroring the `--app` option of `delete-table`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TableGroup {
    Ibge,
    Empresas,
}

impl fmt::Display for TableGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableGroup::Ibge => write!(f, "ibge"),
            TableGroup::Empresas => write!(f, "empresas"),
        }
    }
}

impl FromStr for TableGroup {
    type Err = ImportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ibge" => Ok(TableGroup::Ibge),
            "empresas" => Ok(TableGroup::Empresas),
            other => Err(ImportError::Config(format!("unknown app: {other}"))),
        }
    }
}
