//! Demo datasets used by the CLI and the integration tests.

use std::fmt;
use std::str::FromStr;

use serde_json::{Value, json};

use super::sqlite::Store;
use super::types::{Attribution, ColumnType, RowValues, TableSchema};
use crate::error::{ReflectorError, Result};

/// A bundled demo dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demo {
    /// Product sales by color, for query artifacts
    Sales,
    /// Sunglasses inventory plus a transaction ledger, for policy programs
    Shop,
}

impl Demo {
    pub fn as_str(&self) -> &'static str {
        match self {
            Demo::Sales => "sales",
            Demo::Shop => "shop",
        }
    }
}

impl fmt::Display for Demo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Demo {
    type Err = ReflectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sales" => Ok(Demo::Sales),
            "shop" => Ok(Demo::Shop),
            other => Err(ReflectorError::Config(format!("unknown demo: {}", other))),
        }
    }
}

/// Define the demo's tables and load its rows.
pub fn seed(store: &Store, demo: Demo) -> Result<()> {
    match demo {
        Demo::Sales => seed_sales(store),
        Demo::Shop => seed_shop(store),
    }
}

/// Open an in-memory store loaded with a demo.
pub fn demo_store(demo: Demo) -> Result<Store> {
    let store = Store::open_in_memory()?;
    seed(&store, demo)?;
    Ok(store)
}

fn row(pairs: &[(&str, Value)]) -> RowValues {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn seed_sales(store: &Store) -> Result<()> {
    store.define_table(
        TableSchema::new("sales")
            .column("sale_id", ColumnType::Integer)
            .column("product", ColumnType::Text)
            .column("color", ColumnType::Text)
            .column("quantity", ColumnType::Integer)
            .column("unit_price", ColumnType::Real),
    )?;

    let sales = [
        (1, "Aviator", "black", 4, 89.0),
        (2, "Classic", "brown", 2, 75.0),
        (3, "Moon", "black", 3, 120.0),
        (4, "Wayfarer", "red", 5, 95.0),
        (5, "Aviator", "brown", 6, 89.0),
        (6, "Classic", "black", 1, 75.0),
        (7, "Moon", "red", 2, 120.0),
        (8, "Sport", "blue", 4, 65.0),
        (9, "Wayfarer", "black", 3, 95.0),
        (10, "Sport", "red", 1, 65.0),
    ];
    let rows: Vec<RowValues> = sales
        .iter()
        .map(|(id, product, color, quantity, price)| {
            row(&[
                ("sale_id", json!(id)),
                ("product", json!(product)),
                ("color", json!(color)),
                ("quantity", json!(quantity)),
                ("unit_price", json!(price)),
            ])
        })
        .collect();

    store.write("sales", &rows, None, Attribution::artifact("seed:sales"))?;
    tracing::debug!(rows = rows.len(), "Seeded sales demo");
    Ok(())
}

fn seed_shop(store: &Store) -> Result<()> {
    store.define_table(
        TableSchema::new("inventory")
            .column("item_id", ColumnType::Text)
            .column("name", ColumnType::Text)
            .column("frame", ColumnType::Text)
            .column("price", ColumnType::Real)
            .column("quantity_in_stock", ColumnType::Integer),
    )?;
    store.define_table(
        TableSchema::new("transactions")
            .column("transaction_id", ColumnType::Text)
            .column("customer_name", ColumnType::Text)
            .column("summary", ColumnType::Text)
            .column("amount", ColumnType::Real)
            .column("balance_after", ColumnType::Real),
    )?;

    let items = [
        ("SG001", "Aviator", "metal", 80.0, 12),
        ("SG002", "Classic", "acetate", 60.0, 8),
        ("SG003", "Moon", "round", 120.0, 5),
        ("SG004", "Wayfarer", "acetate", 95.0, 0),
        ("SG005", "Pebble", "round", 70.0, 0),
        ("SG006", "Sport", "wrap", 65.0, 20),
    ];
    let inventory: Vec<RowValues> = items
        .iter()
        .map(|(id, name, frame, price, stock)| {
            row(&[
                ("item_id", json!(id)),
                ("name", json!(name)),
                ("frame", json!(frame)),
                ("price", json!(price)),
                ("quantity_in_stock", json!(stock)),
            ])
        })
        .collect();
    store.write("inventory", &inventory, None, Attribution::artifact("seed:shop"))?;

    let opening = vec![row(&[
        ("transaction_id", json!("TXN-0001")),
        ("customer_name", json!("OPENING")),
        ("summary", json!("Opening balance")),
        ("amount", json!(500.0)),
        ("balance_after", json!(500.0)),
    ])];
    store.write("transactions", &opening, None, Attribution::artifact("seed:shop"))?;

    tracing::debug!(items = inventory.len(), "Seeded shop demo");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_parse() {
        assert_eq!("sales".parse::<Demo>().unwrap(), Demo::Sales);
        assert_eq!("SHOP".parse::<Demo>().unwrap(), Demo::Shop);
        assert!("bank".parse::<Demo>().is_err());
        assert_eq!(Demo::Shop.to_string(), "shop");
    }

    #[test]
    fn test_sales_seed() {
        let store = demo_store(Demo::Sales).unwrap();
        let rows = store
            .read("SELECT color, SUM(quantity) AS total FROM sales GROUP BY color ORDER BY total DESC LIMIT 1")
            .unwrap();
        assert_eq!(rows.rows, vec![vec![json!("black"), json!(11)]]);
    }

    #[test]
    fn test_shop_seed() {
        let store = demo_store(Demo::Shop).unwrap();
        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.tables["inventory"].len(), 6);
        assert_eq!(snapshot.tables["transactions"].len(), 1);
        assert_eq!(snapshot.version, 2);

        let described = store.describe(2).unwrap();
        assert!(described.contains("inventory(item_id TEXT"));
        assert!(described.contains("rows: 6"));
    }
}
