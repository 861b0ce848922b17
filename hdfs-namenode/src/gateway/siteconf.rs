//! An in-place editor of the Hadoop `*-site.xml` property files.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;

use crate::config::Config;
use crate::gateway::SiteConfig;

const CONFIGURATION_OPEN: &str = "<configuration>";
const CONFIGURATION_CLOSE: &str = "</configuration>";

/// A site config editor over the files in the Hadoop conf dir.
pub struct SiteXml {
    config: Arc<Config>,
}

impl SiteXml {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SiteConfig for SiteXml {
    #[tracing::instrument(level = "debug", skip(self, props))]
    async fn set_properties(&self, file: &str, props: &BTreeMap<String, String>) -> Result<()> {
        let path = self.config.hadoop_site_file(file);
        let doc = match tokio::fs::read_to_string(&path).await {
            Ok(doc) => doc,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err).with_context(|| format!("error reading {}", path.display())),
        };
        let doc = set_xml_properties(&doc, props)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.context("error creating hadoop conf dir")?;
        }
        tokio::fs::write(&path, doc).await.with_context(|| format!("error writing {}", path.display()))
    }
}

/// Set the given properties in the given site document.
///
/// Existing properties keep their position in the document and only have their value
/// replaced, whatever other elements they hold. New properties are appended to the end of the
/// configuration block.
pub fn set_xml_properties(doc: &str, props: &BTreeMap<String, String>) -> Result<String> {
    let mut doc = if doc.contains(CONFIGURATION_CLOSE) {
        doc.to_string()
    } else {
        format!("<?xml version=\"1.0\"?>\n{}\n{}\n", CONFIGURATION_OPEN, CONFIGURATION_CLOSE)
    };

    let property_re = Regex::new(r"(?s)<property>.*?</property>").context("error building site property matcher")?;
    let value_re = Regex::new(r"<value>[^<]*</value>|<value\s*/>").context("error building site value matcher")?;
    for (name, value) in props {
        let name_re = Regex::new(&format!(r"<name>\s*{}\s*</name>", regex::escape(&escape_xml(name))))
            .context("error building site name matcher")?;
        let value = format!("<value>{}</value>", escape_xml(value));
        let found = property_re
            .find_iter(&doc)
            .find(|property| name_re.is_match(property.as_str()))
            .map(|property| property.range());
        match found {
            Some(range) => {
                let property = &doc[range.clone()];
                let edited = match (value_re.find(property), name_re.find(property)) {
                    (Some(old), _) => format!("{}{}{}", &property[..old.start()], value, &property[old.end()..]),
                    (None, Some(name)) => format!("{}\n    {}{}", &property[..name.end()], value, &property[name.end()..]),
                    (None, None) => property.to_string(),
                };
                doc.replace_range(range, &edited);
            }
            None => {
                let property = format!(
                    "  <property>\n    <name>{}</name>\n    {}\n  </property>\n",
                    escape_xml(name),
                    value
                );
                let close = doc.rfind(CONFIGURATION_CLOSE).unwrap_or(doc.len());
                doc.insert_str(close, &property);
            }
        }
    }
    Ok(doc)
}

fn escape_xml(val: &str) -> String {
    val.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
