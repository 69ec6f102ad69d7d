//! Image listing.
//!
//! Listings work on a single snapshot of the store. Derived data (dangling
//! status, children) is computed from a reverse parent index built over the
//! whole snapshot before any filter is applied, so it always reflects the
//! full store.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use stevedore_core::error::{ImageError, Result};
use tokio_util::sync::CancellationToken;

use crate::copy::check_canceled;
use crate::reference::NamedReference;
use crate::store::{children_index, find_image, ImageStore, StoredImage};

/// Derived per-image data, populated when requested.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListData {
    /// No names and no image uses it as parent
    pub is_dangling: Option<bool>,
    /// IDs of images naming this one as parent
    pub children: Option<Vec<String>>,
}

/// One listed image.
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub image: StoredImage,
    pub list_data: ListData,
}

/// Listing settings.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Compute `ListData` for every entry
    pub set_list_data: bool,
    /// `key=value` filters, all of which must match
    pub filters: Vec<String>,
}

/// Parsed list filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Dangling(bool),
    /// Name pattern; `*` matches any run of characters
    Reference(String),
    /// ID prefix
    Id(String),
    Label { key: String, value: Option<String> },
    /// Created before the given image
    Before(String),
    /// Created after the given image
    Since(String),
}

impl FromStr for Filter {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| ImageError::InvalidFilter(format!("{}: expected key=value", s)))?;
        if value.is_empty() {
            return Err(ImageError::InvalidFilter(format!("{}: empty value", s)));
        }
        match key {
            "dangling" => match value {
                "true" | "1" => Ok(Filter::Dangling(true)),
                "false" | "0" => Ok(Filter::Dangling(false)),
                _ => Err(ImageError::InvalidFilter(format!(
                    "{}: dangling must be true or false",
                    s
                ))),
            },
            "reference" => Ok(Filter::Reference(value.to_string())),
            "id" => Ok(Filter::Id(
                value.strip_prefix("sha256:").unwrap_or(value).to_string(),
            )),
            "label" => Ok(match value.split_once('=') {
                Some((k, v)) => Filter::Label {
                    key: k.to_string(),
                    value: Some(v.to_string()),
                },
                None => Filter::Label {
                    key: value.to_string(),
                    value: None,
                },
            }),
            "before" => Ok(Filter::Before(value.to_string())),
            "since" => Ok(Filter::Since(value.to_string())),
            other => Err(ImageError::InvalidFilter(format!("unknown filter '{}'", other))),
        }
    }
}

/// Parse every filter, failing on the first invalid one.
pub fn parse_filters(filters: &[String]) -> Result<Vec<Filter>> {
    filters.iter().map(|f| f.parse()).collect()
}

/// Filter with image references resolved against a snapshot.
enum Resolved {
    Plain(Filter),
    Before(DateTime<Utc>),
    Since(DateTime<Utc>),
}

fn timestamp(image: &StoredImage) -> DateTime<Utc> {
    image.created_at.unwrap_or(image.pulled_at)
}

fn resolve_filters(filters: Vec<Filter>, snapshot: &[StoredImage]) -> Result<Vec<Resolved>> {
    filters
        .into_iter()
        .map(|filter| match filter {
            Filter::Before(ref name) | Filter::Since(ref name) => {
                let image = find_image(snapshot, name).ok_or_else(|| {
                    ImageError::InvalidFilter(format!("no such image: {}", name))
                })?;
                let at = timestamp(image);
                Ok(match filter {
                    Filter::Before(_) => Resolved::Before(at),
                    _ => Resolved::Since(at),
                })
            }
            other => Ok(Resolved::Plain(other)),
        })
        .collect()
}

/// Match `text` against `pattern`, where `*` matches any run of characters.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !text.starts_with(first) || text.len() < first.len() + last.len() {
        return false;
    }
    let mut rest = &text[first.len()..];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

/// Whether any name of `image` matches the reference pattern.
///
/// Patterns are tried against the full name, the name without its tag, and
/// for patterns without a slash, the last repository component.
fn reference_matches(pattern: &str, image: &StoredImage) -> bool {
    image.names.iter().any(|name| {
        let mut forms = vec![name.clone()];
        if let Ok(parsed) = NamedReference::parse(name) {
            forms.push(parsed.repository_name());
            if !pattern.contains('/') {
                if let Some(short) = parsed.repository.rsplit('/').next() {
                    forms.push(short.to_string());
                    if let Some(ref tag) = parsed.tag {
                        forms.push(format!("{}:{}", short, tag));
                    }
                }
            }
        }
        forms.iter().any(|form| wildcard_match(pattern, form))
    })
}

fn matches(filter: &Resolved, image: &StoredImage, dangling: bool) -> bool {
    match filter {
        Resolved::Plain(Filter::Dangling(want)) => dangling == *want,
        Resolved::Plain(Filter::Reference(pattern)) => reference_matches(pattern, image),
        Resolved::Plain(Filter::Id(prefix)) => image.id.starts_with(prefix.as_str()),
        Resolved::Plain(Filter::Label { key, value }) => match (image.labels.get(key), value) {
            (Some(actual), Some(want)) => actual == want,
            (Some(_), None) => true,
            (None, _) => false,
        },
        Resolved::Plain(Filter::Before(_)) | Resolved::Plain(Filter::Since(_)) => true,
        Resolved::Before(at) => timestamp(image) < *at,
        Resolved::Since(at) => timestamp(image) > *at,
    }
}

/// List stored images.
///
/// `names` restricts the listing to the given names or IDs, each of which
/// must resolve. Entries are ordered by image ID.
pub async fn list_images(
    ctx: &CancellationToken,
    store: &ImageStore,
    names: Option<&[String]>,
    options: &ListOptions,
) -> Result<Vec<ListEntry>> {
    check_canceled(ctx)?;
    let filters = parse_filters(&options.filters)?;
    let snapshot = store.list().await;
    let filters = resolve_filters(filters, &snapshot)?;

    let wanted: Option<Vec<&str>> = match names {
        Some(names) => Some(
            names
                .iter()
                .map(|name| {
                    find_image(&snapshot, name)
                        .map(|img| img.id.as_str())
                        .ok_or_else(|| ImageError::ImageNotFound(name.clone()))
                })
                .collect::<Result<_>>()?,
        ),
        None => None,
    };

    let needs_index = options.set_list_data
        || filters
            .iter()
            .any(|f| matches!(f, Resolved::Plain(Filter::Dangling(_))));
    let children: BTreeMap<String, Vec<String>> = if needs_index {
        children_index(&snapshot)
    } else {
        BTreeMap::new()
    };

    let mut entries = Vec::new();
    for image in &snapshot {
        if let Some(ref wanted) = wanted {
            if !wanted.contains(&image.id.as_str()) {
                continue;
            }
        }
        let image_children = children.get(&image.id);
        let dangling = image.names.is_empty() && image_children.map_or(true, Vec::is_empty);
        if !filters.iter().all(|f| matches(f, image, dangling)) {
            continue;
        }

        let list_data = if options.set_list_data {
            ListData {
                is_dangling: Some(dangling),
                children: Some(image_children.cloned().unwrap_or_default()),
            }
        } else {
            ListData::default()
        };
        entries.push(ListEntry {
            image: image.clone(),
            list_data,
        });
    }

    tracing::debug!(total = snapshot.len(), listed = entries.len(), "Listed images");
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{commit, test_image};
    use tempfile::TempDir;

    #[test]
    fn test_parse_filters() {
        assert_eq!("dangling=true".parse::<Filter>().unwrap(), Filter::Dangling(true));
        assert_eq!(
            "label=arch=amd64".parse::<Filter>().unwrap(),
            Filter::Label {
                key: "arch".to_string(),
                value: Some("amd64".to_string())
            }
        );
        assert_eq!(
            "id=sha256:abc".parse::<Filter>().unwrap(),
            Filter::Id("abc".to_string())
        );
        for bad in ["dangling", "dangling=maybe", "color=red", "reference="] {
            assert!(
                matches!(bad.parse::<Filter>(), Err(ImageError::InvalidFilter(_))),
                "{}",
                bad
            );
        }
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("alpine", "alpine"));
        assert!(wildcard_match("alp*", "alpine"));
        assert!(wildcard_match("*ine", "alpine"));
        assert!(wildcard_match("a*p*e", "alpine"));
        assert!(wildcard_match("*", ""));
        assert!(!wildcard_match("a*x", "alpine"));
        assert!(!wildcard_match("alpine*e", "alpine"));
        assert!(!wildcard_match("busybox", "alpine"));
    }

    #[tokio::test]
    async fn test_dangling_uses_whole_store() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path()).unwrap();
        let base = commit(&store, &test_image("amd64", &["a"]), &[]).await;
        let child = commit(&store, &test_image("arm64", &["a", "b"]), &[]).await;
        let tagged = commit(&store, &test_image("s390x", &["c"]), &["busybox"]).await;
        let ctx = CancellationToken::new();

        let options = ListOptions {
            set_list_data: true,
            filters: vec!["reference=*".to_string()],
        };
        let entries = list_images(&ctx, &store, None, &options).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].image.id, tagged.id);
        assert_eq!(entries[0].list_data.is_dangling, Some(false));

        let options = ListOptions {
            set_list_data: true,
            filters: vec![],
        };
        let entries = list_images(&ctx, &store, None, &options).await.unwrap();
        let by_id: BTreeMap<_, _> = entries
            .iter()
            .map(|e| (e.image.id.clone(), e.list_data.clone()))
            .collect();
        assert_eq!(by_id[&base.id].is_dangling, Some(false));
        assert_eq!(by_id[&base.id].children, Some(vec![child.id.clone()]));
        assert_eq!(by_id[&child.id].is_dangling, Some(true));

        let options = ListOptions {
            set_list_data: false,
            filters: vec!["dangling=true".to_string()],
        };
        let entries = list_images(&ctx, &store, None, &options).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].image.id, child.id);
        assert_eq!(entries[0].list_data, ListData::default());
    }

    #[tokio::test]
    async fn test_entries_ordered_by_id() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path()).unwrap();
        for arch in ["amd64", "arm64", "s390x", "ppc64le"] {
            commit(&store, &test_image(arch, &[arch]), &[]).await;
        }
        let entries = list_images(&CancellationToken::new(), &store, None, &ListOptions::default())
            .await
            .unwrap();
        let ids: Vec<_> = entries.iter().map(|e| e.image.id.clone()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn test_reference_and_label_filters() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path()).unwrap();
        let alpine = commit(&store, &test_image("amd64", &["a"]), &["alpine:3.19"]).await;
        commit(&store, &test_image("arm64", &["b"]), &["quay.io/org/busybox"]).await;
        let ctx = CancellationToken::new();

        let list = |filters: &[&str]| {
            let options = ListOptions {
                set_list_data: false,
                filters: filters.iter().map(|f| f.to_string()).collect(),
            };
            let store = store.clone();
            let ctx = ctx.clone();
            async move { list_images(&ctx, &store, None, &options).await }
        };

        let found = list(&["reference=alpine"]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].image.id, alpine.id);
        assert_eq!(list(&["reference=alpine:3.19"]).await.unwrap().len(), 1);
        assert_eq!(list(&["reference=docker.io/library/alp*"]).await.unwrap().len(), 1);
        assert_eq!(list(&["reference=quay.io/org/*"]).await.unwrap().len(), 1);
        assert_eq!(list(&["label=arch=arm64"]).await.unwrap().len(), 1);
        assert_eq!(list(&["label=arch"]).await.unwrap().len(), 2);
        assert_eq!(list(&["label=arch", "reference=busy*"]).await.unwrap().len(), 1);
        assert!(matches!(
            list(&["since=nothing"]).await,
            Err(ImageError::InvalidFilter(_))
        ));
    }

    #[tokio::test]
    async fn test_names_argument() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path()).unwrap();
        let alpine = commit(&store, &test_image("amd64", &["a"]), &["alpine"]).await;
        commit(&store, &test_image("arm64", &["b"]), &["busybox"]).await;
        let ctx = CancellationToken::new();

        let names = vec!["alpine".to_string()];
        let entries = list_images(&ctx, &store, Some(&names), &ListOptions::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].image.id, alpine.id);

        let names = vec!["nginx".to_string()];
        assert!(matches!(
            list_images(&ctx, &store, Some(&names), &ListOptions::default()).await,
            Err(ImageError::ImageNotFound(_))
        ));
    }
}
