//! Decoding of upstream `plugin-repository` documents.

use std::collections::BTreeMap;

use plugin_mirror::{ArtifactKey, Catalog, CatalogEntry, CatalogError, Feedback, ProductVersion};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::Url;

const ROOT: &[u8] = b"plugin-repository";
const PLUGIN: &[u8] = b"idea-plugin";
const IDEA_VERSION: &[u8] = b"idea-version";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Id,
    Version,
    Name,
    Description,
}

impl Field {
    fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"id" => Some(Self::Id),
            b"version" => Some(Self::Version),
            b"name" => Some(Self::Name),
            b"description" => Some(Self::Description),
            _ => None,
        }
    }
}

/// Fields collected for one `<idea-plugin>` until its end tag.
#[derive(Default)]
struct PendingPlugin {
    /// Element depth of the `<idea-plugin>` start tag.
    depth: usize,
    id: Option<String>,
    version: Option<String>,
    name: Option<String>,
    description: Option<String>,
    url: Option<String>,
    checksum: Option<String>,
    size: Option<u64>,
    idea_version: BTreeMap<String, String>,
    field: Option<Field>,
}

impl PendingPlugin {
    fn open(start: &BytesStart<'_>, depth: usize) -> Result<Self, CatalogError> {
        let mut plugin = Self {
            depth,
            ..Self::default()
        };
        for (key, value) in attributes(start)? {
            match key.as_str() {
                "url" if !value.is_empty() => plugin.url = Some(value),
                "sha256" if !value.is_empty() => plugin.checksum = Some(value.to_ascii_lowercase()),
                "size" => plugin.size = value.trim().parse().ok(),
                _ => {}
            }
        }
        Ok(plugin)
    }

    fn push_text(&mut self, text: &str) {
        let slot = match self.field {
            Some(Field::Id) => &mut self.id,
            Some(Field::Version) => &mut self.version,
            Some(Field::Name) => &mut self.name,
            Some(Field::Description) => &mut self.description,
            None => return,
        };
        slot.get_or_insert_with(String::new).push_str(text);
    }

    fn finish(self, download_endpoint: &Url) -> Result<CatalogEntry, &'static str> {
        let id = self
            .id
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .ok_or("missing id")?;
        let version = self
            .version
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .ok_or("missing version")?;

        let download_url = match self.url {
            Some(url) => url,
            None => {
                let mut url = download_endpoint.clone();
                url.query_pairs_mut()
                    .append_pair("pluginId", &id)
                    .append_pair("version", &version);
                url.to_string()
            }
        };

        Ok(CatalogEntry {
            name: self
                .name
                .map(|s| s.trim().to_owned())
                .unwrap_or_else(|| id.clone()),
            key: ArtifactKey::new(id, version),
            description: self.description,
            download_url,
            checksum: self.checksum,
            size: self.size,
            idea_version: self.idea_version,
        })
    }
}

fn attributes(start: &BytesStart<'_>) -> Result<Vec<(String, String)>, CatalogError> {
    start
        .attributes()
        .map(|attr| {
            let attr = attr.map_err(|e| CatalogError::Malformed(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| CatalogError::Malformed(e.to_string()))?
                .into_owned();
            Ok((key, value))
        })
        .collect()
}

/// Decode a `plugin-repository` document.
///
/// Every `<idea-plugin>` at any depth becomes an entry. Entries without an
/// id or version are dropped and reported as warnings on the catalog.
/// Download URLs not given by the document are derived from
/// `download_endpoint` with `pluginId` and `version` query parameters.
pub fn parse_catalog(
    version: &ProductVersion,
    document: &str,
    download_endpoint: &Url,
) -> Result<Catalog, CatalogError> {
    let mut reader = Reader::from_str(document);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut feedback = Vec::new();
    let mut depth = 0usize;
    let mut seen_root = false;
    let mut current: Option<PendingPlugin> = None;
    let mut position = 0usize;

    loop {
        let event = reader.read_event().map_err(|e| {
            CatalogError::Malformed(format!(
                "XML error at byte {}: {e}",
                reader.buffer_position()
            ))
        })?;

        match event {
            Event::Start(start) => {
                depth += 1;
                let name = start.name();
                if !seen_root {
                    check_root(name.as_ref())?;
                    seen_root = true;
                    continue;
                }
                if let Some(plugin) = current.as_mut() {
                    if depth == plugin.depth + 1 {
                        if name.as_ref() == IDEA_VERSION {
                            plugin.idea_version.extend(attributes(&start)?);
                        }
                        plugin.field = Field::from_tag(name.as_ref());
                    }
                } else if name.as_ref() == PLUGIN {
                    position += 1;
                    current = Some(PendingPlugin::open(&start, depth)?);
                }
            }
            Event::Empty(start) => {
                let name = start.name();
                if !seen_root {
                    check_root(name.as_ref())?;
                    seen_root = true;
                    continue;
                }
                if let Some(plugin) = current.as_mut() {
                    if depth == plugin.depth && name.as_ref() == IDEA_VERSION {
                        plugin.idea_version.extend(attributes(&start)?);
                    }
                } else if name.as_ref() == PLUGIN {
                    position += 1;
                    feedback.push(Feedback::warning(format!(
                        "skipping plugin entry #{position}: missing id"
                    )));
                }
            }
            Event::Text(text) => {
                if let Some(plugin) = &mut current {
                    let text = text
                        .unescape()
                        .map_err(|e| CatalogError::Malformed(e.to_string()))?;
                    plugin.push_text(&text);
                }
            }
            Event::CData(data) => {
                if let Some(plugin) = &mut current {
                    plugin.push_text(&String::from_utf8_lossy(&data));
                }
            }
            Event::End(_) => {
                match current.take() {
                    Some(plugin) if depth == plugin.depth => {
                        match plugin.finish(download_endpoint) {
                            Ok(entry) => entries.push(entry),
                            Err(reason) => feedback.push(Feedback::warning(format!(
                                "skipping plugin entry #{position}: {reason}"
                            ))),
                        }
                    }
                    Some(mut plugin) => {
                        if depth == plugin.depth + 1 {
                            plugin.field = None;
                        }
                        current = Some(plugin);
                    }
                    None => {}
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        return Err(CatalogError::Malformed("document has no root element".into()));
    }

    tracing::debug!(
        %version,
        entries = entries.len(),
        rejected = feedback.len(),
        "decoded plugin repository"
    );

    Ok(Catalog {
        version: version.clone(),
        entries,
        feedback,
    })
}

fn check_root(name: &[u8]) -> Result<(), CatalogError> {
    if name == ROOT {
        Ok(())
    } else {
        Err(CatalogError::Malformed(format!(
            "unexpected root element <{}>",
            String::from_utf8_lossy(name)
        )))
    }
}
