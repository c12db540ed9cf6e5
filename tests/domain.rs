use std::str::FromStr;

use assert_matches::assert_matches;
use clap::ValueEnum;

use ibge_importer::domain::{ImportTarget, Table, TableGroup};
use ibge_importer::error::ImportError;

#[test]
fn import_targets_parse_from_cli_names() {
    assert_eq!(ImportTarget::from_str("todos", true).unwrap(), ImportTarget::Todos);
    assert_eq!(
        ImportTarget::from_str("MUNICIPIOS", true).unwrap(),
        ImportTarget::Municipios
    );
    assert!(ImportTarget::from_str("bairros", true).is_err());
    assert_eq!(ImportTarget::Distritos.to_string(), "distritos");
}

#[test]
fn tables_are_listed_parents_first() {
    let position = |table: Table| Table::ALL.iter().position(|t| *t == table).unwrap();
    assert!(position(Table::Regions) < position(Table::States));
    assert!(position(Table::States) < position(Table::IntermediateRegions));
    assert!(position(Table::IntermediateRegions) < position(Table::ImmediateRegions));
    assert!(position(Table::Mesoregions) < position(Table::Microregions));
    assert!(position(Table::Microregions) < position(Table::Municipalities));
    assert!(position(Table::Municipalities) < position(Table::Districts));
}

#[test]
fn every_table_resolves_by_its_own_name() {
    for table in Table::ALL {
        assert_eq!(Table::resolve(table.group(), table.name()).unwrap(), table);
    }
}

#[test]
fn unknown_model_names_its_app() {
    let err = Table::resolve(TableGroup::Ibge, "Bairro").unwrap_err();
    assert_matches!(
        err,
        ImportError::UnknownTable { ref app, ref model } if app == "ibge" && model == "Bairro"
    );
}

#[test]
fn table_groups_parse_case_insensitively() {
    assert_eq!(<TableGroup as FromStr>::from_str("Empresas").unwrap(), TableGroup::Empresas);
    assert_matches!(
        <TableGroup as FromStr>::from_str("geo"),
        Err(ImportError::Config(_))
    );
}
