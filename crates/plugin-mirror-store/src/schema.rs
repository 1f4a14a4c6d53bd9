use rusqlite_migration::{M, Migrations};

pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "CREATE TABLE artifacts (
            plugin_id       TEXT NOT NULL,
            version         TEXT NOT NULL,
            checksum        TEXT NOT NULL,
            relative_path   TEXT NOT NULL,
            size            INTEGER NOT NULL,
            completed_at    INTEGER NOT NULL,
            PRIMARY KEY (plugin_id, version)
        );

        CREATE TABLE catalogs (
            product_version TEXT PRIMARY KEY,
            file_name       TEXT NOT NULL,
            entries         INTEGER NOT NULL,
            published_at    INTEGER NOT NULL
        );

        CREATE TABLE catalog_entries (
            product_version TEXT NOT NULL,
            plugin_id       TEXT NOT NULL,
            version         TEXT NOT NULL,
            relative_path   TEXT NOT NULL,
            PRIMARY KEY (product_version, plugin_id, version, relative_path),
            FOREIGN KEY (product_version) REFERENCES catalogs(product_version)
        );

        CREATE INDEX idx_catalog_entries_key ON catalog_entries(plugin_id, version);
        CREATE INDEX idx_catalogs_file ON catalogs(file_name);",
    )])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_valid() {
        assert!(migrations().validate().is_ok());
    }
}
