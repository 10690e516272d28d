use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use reqwest::blocking::Client;
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::base_url;
use crate::error::{ConfigError, NearbyError, TestError};
use crate::transport::USER_AGENT;

pub const SERVER_LIST_URL: &str = "https://www.speedtest.net/speedtest-servers-static.php";

/// A cached list younger than this is used without refetching.
pub const CACHE_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// How many entries `servers --nearby` prints.
pub const LISTED: usize = 10;

/// One `<server>` entry. The list arrives sorted by distance from the caller.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct NearbyServer {
    #[serde(rename = "@host")]
    pub host: String,
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "@cc", default)]
    pub cc: String,
    #[serde(rename = "@sponsor", default)]
    pub sponsor: String,
}

impl NearbyServer {
    pub fn url(&self) -> Result<Url, ConfigError> {
        base_url(&format!("http://{}/", self.host))
    }
}

impl fmt::Display for NearbyServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}/\t{}, {}\t{}", self.host, self.name, self.cc, self.sponsor)
    }
}

#[derive(Deserialize)]
struct ServerListDocument {
    #[serde(default)]
    servers: ServerEntries,
}

#[derive(Default, Deserialize)]
struct ServerEntries {
    #[serde(rename = "server", default)]
    entries: Vec<NearbyServer>,
}

pub fn parse_servers(xml: &str) -> Result<Vec<NearbyServer>, NearbyError> {
    let doc: ServerListDocument = quick_xml::de::from_str(xml).map_err(NearbyError::Parse)?;
    Ok(doc.servers.entries)
}

/// `$XDG_CACHE_HOME/qospeedtest/speedtest-servers-static.xml`, or under `~/.cache`.
pub fn cache_path() -> Option<PathBuf> {
    let base = env::var_os("XDG_CACHE_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))?;
    Some(base.join("qospeedtest").join("speedtest-servers-static.xml"))
}

fn is_fresh(path: &Path, max_age: Duration) -> bool {
    let Ok(modified) = fs::metadata(path).and_then(|m| m.modified()) else {
        return false;
    };
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age < max_age,
        // Modified in the future.
        Err(_) => true,
    }
}

fn read_cache(path: &Path) -> Result<String, NearbyError> {
    fs::read_to_string(path).map_err(|source| NearbyError::Cache {
        path: path.display().to_string(),
        source,
    })
}

fn write_cache(path: &Path, xml: &str) -> Result<(), NearbyError> {
    let cache_err = |source| NearbyError::Cache {
        path: path.display().to_string(),
        source,
    };
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(cache_err)?;
    }
    fs::write(path, xml).map_err(cache_err)
}

/// Server list from a fresh cache, else from `fetch`. A failed fetch falls
/// back to an outdated cache when one exists.
pub fn load_servers<F>(cache: Option<&Path>, max_age: Duration, fetch: F) -> Result<Vec<NearbyServer>, NearbyError>
where
    F: FnOnce() -> Result<String, TestError>,
{
    if let Some(path) = cache.filter(|p| is_fresh(p, max_age)) {
        debug!(path = %path.display(), "Using cached server list");
        return parse_servers(&read_cache(path)?);
    }

    match fetch() {
        Ok(xml) => {
            let servers = parse_servers(&xml)?;
            if let Some(path) = cache {
                if let Err(e) = write_cache(path, &xml) {
                    warn!(error = %e, "Could not cache server list");
                }
            }
            Ok(servers)
        }
        Err(e) => match cache.filter(|p| p.exists()) {
            Some(path) => {
                warn!(error = %e, path = %path.display(), "Server list fetch failed, using outdated cache instead");
                parse_servers(&read_cache(path)?)
            }
            None => Err(NearbyError::Fetch(e)),
        },
    }
}

pub fn fetch_server_list(timeout: Duration) -> Result<String, TestError> {
    let client = Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| TestError::transport(SERVER_LIST_URL, e))?;
    let response = client
        .get(SERVER_LIST_URL)
        .send()
        .map_err(|e| TestError::transport(SERVER_LIST_URL, e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(TestError::Status {
            url: SERVER_LIST_URL.to_string(),
            status,
        });
    }
    response.text().map_err(|e| TestError::transport(SERVER_LIST_URL, e))
}

/// Nearby servers, closest first, through the on-disk cache.
pub fn servers(timeout: Duration) -> Result<Vec<NearbyServer>, NearbyError> {
    load_servers(cache_path().as_deref(), CACHE_MAX_AGE, || fetch_server_list(timeout))
}

pub fn closest(timeout: Duration) -> Result<NearbyServer, NearbyError> {
    servers(timeout)?.into_iter().next().ok_or(NearbyError::Empty)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    const FIXTURE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<settings>
<servers>
<server url="http://speedtest.one.example:8080/speedtest/upload.php" lat="41.8" lon="-87.6" name="Chicago, IL" country="United States" cc="US" sponsor="One Fiber" id="101" host="speedtest.one.example:8080" />
<server url="http://st2.example.net:8080/speedtest/upload.php" lat="43.0" lon="-87.9" name="Milwaukee, WI" country="United States" cc="US" sponsor="Two &amp; Co" id="102" host="st2.example.net:8080" />
</servers>
</settings>
"#;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("qospeedtest-nearby-{name}-{}", std::process::id()));
        fs::remove_dir_all(&dir).ok();
        dir
    }

    fn offline() -> Result<String, TestError> {
        Err(TestError::transport(SERVER_LIST_URL, std::io::Error::from(std::io::ErrorKind::ConnectionRefused)))
    }

    #[test]
    fn parses_fixture_in_order() {
        let servers = parse_servers(FIXTURE).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].host, "speedtest.one.example:8080");
        assert_eq!(servers[0].name, "Chicago, IL");
        assert_eq!(servers[1].sponsor, "Two & Co");
        assert_eq!(servers[0].url().unwrap().as_str(), "http://speedtest.one.example:8080/");
    }

    #[test]
    fn listing_line() {
        let servers = parse_servers(FIXTURE).unwrap();
        assert_eq!(
            servers[1].to_string(),
            "http://st2.example.net:8080/\tMilwaukee, WI, US\tTwo & Co"
        );
    }

    #[test]
    fn empty_and_broken_lists() {
        assert!(parse_servers("<settings><servers></servers></settings>").unwrap().is_empty());
        assert!(matches!(parse_servers("<settings><servers>"), Err(NearbyError::Parse(_))));
    }

    #[test]
    fn fresh_cache_skips_fetch() {
        let dir = scratch_dir("fresh");
        let cache = dir.join("list.xml");
        write_cache(&cache, FIXTURE).unwrap();

        let servers = load_servers(Some(&cache), CACHE_MAX_AGE, || panic!("fetched despite fresh cache")).unwrap();
        assert_eq!(servers.len(), 2);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn stale_cache_is_refreshed() {
        let dir = scratch_dir("refresh");
        let cache = dir.join("list.xml");
        write_cache(&cache, "<settings><servers></servers></settings>").unwrap();

        let fetched = Cell::new(false);
        let servers = load_servers(Some(&cache), Duration::ZERO, || {
            fetched.set(true);
            Ok(FIXTURE.to_string())
        })
        .unwrap();
        assert!(fetched.get());
        assert_eq!(servers.len(), 2);
        assert_eq!(fs::read_to_string(&cache).unwrap(), FIXTURE);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn failed_fetch_falls_back_to_stale_cache() {
        let dir = scratch_dir("stale");
        let cache = dir.join("list.xml");
        write_cache(&cache, FIXTURE).unwrap();

        let servers = load_servers(Some(&cache), Duration::ZERO, offline).unwrap();
        assert_eq!(servers[0].sponsor, "One Fiber");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn failed_fetch_without_cache() {
        let dir = scratch_dir("none");
        let cache = dir.join("list.xml");
        let err = load_servers(Some(&cache), CACHE_MAX_AGE, offline).unwrap_err();
        assert!(matches!(err, NearbyError::Fetch(ref e) if e.is_transport()), "{err}");
        assert!(!cache.exists());
    }

    #[test]
    fn fetched_list_is_cached() {
        let dir = scratch_dir("write");
        let cache = dir.join("nested").join("list.xml");
        load_servers(Some(&cache), CACHE_MAX_AGE, || Ok(FIXTURE.to_string())).unwrap();
        assert!(is_fresh(&cache, CACHE_MAX_AGE));
        fs::remove_dir_all(&dir).ok();
    }
}
