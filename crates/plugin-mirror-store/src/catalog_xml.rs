//! Rendering of the local catalog served to IDEs as a custom plugin
//! repository.

use plugin_mirror::{LocalCatalog, StoreError};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use crate::layout;

fn xml_error(e: impl std::fmt::Display) -> StoreError {
    StoreError::Io(format!("rendering catalog: {e}"))
}

/// Render `catalog` as a `<plugins>` document with URLs under `storage_url`.
pub fn render(catalog: &LocalCatalog, storage_url: &str) -> Result<Vec<u8>, StoreError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Start(BytesStart::new("plugins")))
        .map_err(xml_error)?;

    for item in &catalog.entries {
        let url = layout::artifact_url(storage_url, &item.artifact.relative_path);
        let plugin = BytesStart::new("plugin").with_attributes([
            ("id", item.entry.plugin_id()),
            ("url", url.as_str()),
            ("version", item.entry.version()),
        ]);
        writer.write_event(Event::Start(plugin)).map_err(xml_error)?;

        let idea_version = BytesStart::new("idea-version").with_attributes(
            item.entry
                .idea_version
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        writer
            .write_event(Event::Empty(idea_version))
            .map_err(xml_error)?;

        write_text_element(&mut writer, "name", &item.entry.name)?;
        if let Some(description) = &item.entry.description {
            write_text_element(&mut writer, "description", description)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("plugin")))
            .map_err(xml_error)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("plugins")))
        .map_err(xml_error)?;

    let mut document = writer.into_inner();
    document.push(b'\n');
    Ok(document)
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    tag: &str,
    text: &str,
) -> Result<(), StoreError> {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .map_err(xml_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use plugin_mirror::{
        ArtifactKey, CatalogEntry, LocalCatalogEntry, ProductVersion, StoredArtifact,
    };

    use super::*;

    fn item(id: &str, version: &str, description: Option<&str>) -> LocalCatalogEntry {
        let key = ArtifactKey::new(id, version);
        LocalCatalogEntry {
            entry: CatalogEntry {
                key: key.clone(),
                name: format!("{id} & friends"),
                description: description.map(str::to_owned),
                download_url: String::new(),
                checksum: None,
                size: None,
                idea_version: BTreeMap::from([
                    ("since-build".to_owned(), "203.0".to_owned()),
                    ("until-build".to_owned(), "203.*".to_owned()),
                ]),
            },
            artifact: StoredArtifact {
                key,
                checksum: "c".into(),
                relative_path: format!("aaa/bbb/{id}.zip"),
                size: 1,
                completed_at: 0,
            },
        }
    }

    #[test]
    fn renders_plugins_document() {
        let catalog = LocalCatalog {
            version: ProductVersion::new("IC-203.1"),
            entries: vec![item("foo", "1.0", Some("<b>bold</b>")), item("bar", "2.0", None)],
        };

        let xml = String::from_utf8(render(&catalog, "https://mirror.test/plugins/").unwrap())
            .unwrap();

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains(
            r#"<plugin id="foo" url="https://mirror.test/plugins/aaa/bbb/foo.zip" version="1.0">"#
        ));
        assert!(xml.contains(r#"<idea-version since-build="203.0" until-build="203.*"/>"#));
        assert!(xml.contains("<name>foo &amp; friends</name>"));
        assert!(xml.contains("<description>&lt;b&gt;bold&lt;/b&gt;</description>"));
        assert_eq!(xml.matches("<description>").count(), 1);
        assert!(xml.find("id=\"foo\"") < xml.find("id=\"bar\""));
        assert!(xml.trim_end().ends_with("</plugins>"));
    }

    #[test]
    fn empty_catalog_is_still_a_document() {
        let catalog = LocalCatalog {
            version: ProductVersion::new("IC-203.1"),
            entries: Vec::new(),
        };
        let xml = String::from_utf8(render(&catalog, "https://mirror.test/").unwrap()).unwrap();
        assert!(xml.contains("<plugins>"));
        assert!(xml.contains("</plugins>"));
    }
}
