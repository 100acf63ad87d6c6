//! Video title metadata.
//!
//! Looks titles up on OMDb and refines a video job's output directory
//! into a media-server friendly layout:
//! `<root>/Movies/<Title (Year)>` or `<root>/Shows/<Title (Year)>/Season <N>`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::output::sanitize_label;
use crate::error::{ControlError, ControlResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleKind {
    Movie,
    Series,
}

#[derive(Debug, Clone, Serialize)]
pub struct TitleMatch {
    pub imdb_id: String,
    pub title: String,
    pub year: Option<String>,
    pub kind: TitleKind,
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn search(&self, query: &str) -> ControlResult<Vec<TitleMatch>>;
    async fn lookup(&self, imdb_id: &str) -> ControlResult<TitleMatch>;
}

/// Directory for a matched title under the video output root.
pub fn refined_output_dir(
    video_root: &Path,
    title: &TitleMatch,
    season: Option<u32>,
) -> PathBuf {
    let name = match first_year(title.year.as_deref()) {
        Some(year) => format!("{} ({year})", sanitize_label(&title.title)),
        None => sanitize_label(&title.title),
    };
    match title.kind {
        TitleKind::Movie => video_root.join("Movies").join(name),
        TitleKind::Series => {
            let series = video_root.join("Shows").join(name);
            match season {
                Some(n) => series.join(format!("Season {n}")),
                None => series,
            }
        }
    }
}

// OMDb reports series years as a range ("2008-2013"); the layout wants
// the first year only.
fn first_year(year: Option<&str>) -> Option<String> {
    let year = year?;
    let digits: String = year.chars().take_while(|c| c.is_ascii_digit()).collect();
    (digits.len() == 4).then_some(digits)
}

pub struct OmdbProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Deserialize)]
struct OmdbSearchResponse {
    #[serde(rename = "Search")]
    search: Option<Vec<OmdbEntry>>,
    #[serde(rename = "Response")]
    response: String,
    #[serde(rename = "Error")]
    error: Option<String>,
}

#[derive(Deserialize)]
struct OmdbEntry {
    #[serde(rename = "Title")]
    title: String,
    #[serde(rename = "Year")]
    year: Option<String>,
    #[serde(rename = "imdbID")]
    imdb_id: String,
    #[serde(rename = "Type")]
    kind: Option<String>,
    #[serde(rename = "Response")]
    response: Option<String>,
    #[serde(rename = "Error")]
    error: Option<String>,
}

impl OmdbEntry {
    fn into_match(self) -> TitleMatch {
        let kind = match self.kind.as_deref() {
            Some("series") => TitleKind::Series,
            _ => TitleKind::Movie,
        };
        TitleMatch {
            imdb_id: self.imdb_id,
            title: self.title,
            year: self.year,
            kind,
        }
    }
}

impl OmdbProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: "https://www.omdbapi.com".to_string(),
        }
    }

    #[cfg(test)]
    fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
        }
    }
}

#[async_trait]
impl MetadataProvider for OmdbProvider {
    async fn search(&self, query: &str) -> ControlResult<Vec<TitleMatch>> {
        let body: OmdbSearchResponse = self
            .client
            .get(&self.base_url)
            .query(&[("apikey", self.api_key.as_str()), ("s", query)])
            .send()
            .await
            .map_err(|e| ControlError::Metadata(e.to_string()))?
            .json()
            .await
            .map_err(|e| ControlError::Metadata(e.to_string()))?;

        if body.response != "True" {
            return Err(ControlError::Metadata(
                body.error.unwrap_or_else(|| "no results".to_string()),
            ));
        }
        Ok(body
            .search
            .unwrap_or_default()
            .into_iter()
            .map(OmdbEntry::into_match)
            .collect())
    }

    async fn lookup(&self, imdb_id: &str) -> ControlResult<TitleMatch> {
        let entry: OmdbEntry = self
            .client
            .get(&self.base_url)
            .query(&[("apikey", self.api_key.as_str()), ("i", imdb_id)])
            .send()
            .await
            .map_err(|e| ControlError::Metadata(e.to_string()))?
            .json()
            .await
            .map_err(|e| ControlError::Metadata(e.to_string()))?;

        if entry.response.as_deref() == Some("False") {
            return Err(ControlError::Metadata(
                entry.error.unwrap_or_else(|| "not found".to_string()),
            ));
        }
        Ok(entry.into_match())
    }
}

/// The configured provider, if any. Metadata endpoints are disabled
/// without an API key.
pub fn provider_from_key(api_key: Option<&String>) -> Option<Arc<dyn MetadataProvider>> {
    api_key
        .filter(|k| !k.is_empty())
        .map(|k| Arc::new(OmdbProvider::new(k.clone())) as Arc<dyn MetadataProvider>)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn movie_dir_is_title_and_year_under_movies() {
        let m = TitleMatch {
            imdb_id: "tt0137523".to_string(),
            title: "Fight Club".to_string(),
            year: Some("1999".to_string()),
            kind: TitleKind::Movie,
        };
        assert_eq!(
            refined_output_dir(Path::new("/out/video"), &m, None),
            PathBuf::from("/out/video/Movies/Fight Club (1999)")
        );
    }

    #[test]
    fn series_dir_takes_first_year_and_season() {
        let m = TitleMatch {
            imdb_id: "tt0903747".to_string(),
            title: "Breaking Bad".to_string(),
            year: Some("2008-2013".to_string()),
            kind: TitleKind::Series,
        };
        assert_eq!(
            refined_output_dir(Path::new("/out/video"), &m, Some(2)),
            PathBuf::from("/out/video/Shows/Breaking Bad (2008)/Season 2")
        );
        assert_eq!(
            refined_output_dir(Path::new("/out/video"), &m, None),
            PathBuf::from("/out/video/Shows/Breaking Bad (2008)")
        );
    }

    #[test]
    fn title_with_path_hazards_is_sanitized() {
        let m = TitleMatch {
            imdb_id: "tt1".to_string(),
            title: "A/B: The <Sequel>".to_string(),
            year: None,
            kind: TitleKind::Movie,
        };
        assert_eq!(
            refined_output_dir(Path::new("/v"), &m, None),
            PathBuf::from("/v/Movies/AB The Sequel")
        );
    }

    #[test]
    fn omdb_search_payload_decodes() {
        let raw = r#"{
            "Search": [
                {"Title": "Blade Runner", "Year": "1982", "imdbID": "tt0083658", "Type": "movie", "Poster": "N/A"}
            ],
            "totalResults": "1",
            "Response": "True"
        }"#;
        let body: OmdbSearchResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(body.response, "True");
        let entry = body.search.unwrap().remove(0);
        let m = entry.into_match();
        assert_eq!(m.imdb_id, "tt0083658");
        assert_eq!(m.kind, TitleKind::Movie);
    }

    #[tokio::test]
    async fn unreachable_backend_surfaces_a_metadata_error() {
        let p = OmdbProvider::with_base_url("k".to_string(), "http://127.0.0.1:9".to_string());
        assert!(matches!(
            p.search("anything").await.unwrap_err(),
            ControlError::Metadata(_)
        ));
    }
}
