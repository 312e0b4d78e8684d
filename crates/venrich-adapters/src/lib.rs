//! Provider contract, the four built-in providers and the upstream seed adapter.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;
use venrich_core::{fill_text_if_empty, BusinessData, OpeningHours, SourceTag};
use venrich_storage::{FetchError, HttpFetcher, Url};

pub const CRATE_NAME: &str = "venrich-adapters";

pub const POSTCODE_LOOKUP: &str = "postcode-lookup";
pub const PLACES_LOOKUP: &str = "places-lookup";
pub const GAZETTEER_LOOKUP: &str = "gazetteer-lookup";
pub const FALLBACK_HEURISTIC: &str = "fallback-heuristic";

/// Provider ids in default chain order.
pub const DEFAULT_CHAIN: [&str; 4] = [
    POSTCODE_LOOKUP,
    PLACES_LOOKUP,
    GAZETTEER_LOOKUP,
    FALLBACK_HEURISTIC,
];

/// Status the places proxy answers with when it has no API key.
pub const PLACES_NOT_CONFIGURED: &str = "NOT_CONFIGURED";

#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub request_id: Uuid,
    pub venue_id: String,
    /// The record as the caller supplied it, before any provider ran.
    pub seed: BusinessData,
}

impl ProviderContext {
    pub fn new(venue_id: impl Into<String>, seed: BusinessData) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            venue_id: venue_id.into(),
            seed,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

/// One enrichment step.
///
/// `enrich` must not fail: `None` means "nothing to add" and is equivalent to
/// handing `current` back unchanged. Built-in providers log and degrade to
/// `None` on any internal error.
#[async_trait]
pub trait Provider: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn enrich(
        &self,
        http: &HttpFetcher,
        ctx: &ProviderContext,
        current: &BusinessData,
    ) -> Option<BusinessData>;
}

/// Endpoints and switches for the built-in providers.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub postcodes_url: String,
    pub places_enabled: bool,
    pub places_url: String,
    pub gazetteer_url: String,
    pub contact_email: String,
    pub accept_language: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            postcodes_url: "https://api.postcodes.io/postcodes".to_string(),
            places_enabled: false,
            places_url: "http://localhost:8787/api/places".to_string(),
            gazetteer_url: "https://nominatim.openstreetmap.org/search".to_string(),
            contact_email: String::new(),
            accept_language: "en-GB".to_string(),
        }
    }
}

fn degrade(
    provider_id: &'static str,
    ctx: &ProviderContext,
    result: Result<Option<BusinessData>, ProviderError>,
) -> Option<BusinessData> {
    match result {
        Ok(out) => out,
        Err(err) => {
            warn!(
                provider = provider_id,
                request_id = %ctx.request_id,
                venue_id = %ctx.venue_id,
                error = %err,
                "provider failed; continuing without its data"
            );
            None
        }
    }
}

fn json_value<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_value(value, path)?.as_str()
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    json_value(value, path)?.as_f64()
}

/// First alias whose value is a non-empty string (or a number).
fn first_text(value: &JsonValue, aliases: &[&str]) -> Option<String> {
    aliases
        .iter()
        .filter_map(|key| value.get(*key))
        .find_map(scalar_text)
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn join_query(parts: &[Option<&str>]) -> String {
    parts
        .iter()
        .flatten()
        .copied()
        .collect::<Vec<_>>()
        .join(", ")
}

fn endpoint_url(base: &str, suffix: &str) -> Result<Url, ProviderError> {
    let joined = format!("{}/{}", base.trim_end_matches('/'), suffix);
    Url::parse(&joined).map_err(|e| ProviderError::Message(format!("bad endpoint {joined}: {e}")))
}

#[derive(Debug, Clone)]
pub struct PostcodeLookup {
    pub endpoint: String,
}

impl PostcodeLookup {
    async fn lookup(
        &self,
        http: &HttpFetcher,
        current: &BusinessData,
    ) -> Result<Option<BusinessData>, ProviderError> {
        let Some(postcode) = non_empty(&current.postcode) else {
            return Ok(None);
        };
        let compact: String = postcode.chars().filter(|c| !c.is_whitespace()).collect();

        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| ProviderError::Message(format!("bad endpoint {}: {e}", self.endpoint)))?;
        url.path_segments_mut()
            .map_err(|_| ProviderError::Message(format!("endpoint {} cannot take a path", self.endpoint)))?
            .pop_if_empty()
            .push(&compact);

        let body = http.fetch_json(url.as_str(), &[]).await?;
        let Some(result) = json_value(&body, &["result"]) else {
            return Ok(None);
        };

        let area = json_str(result, &["admin_district"])
            .or_else(|| json_str(result, &["codes", "admin_district"]));
        let region = json_str(result, &["admin_county"])
            .or_else(|| json_str(result, &["codes", "admin_county"]));

        let mut out = current.clone();
        if let Some(lat) = json_f64(result, &["latitude"]) {
            out.set_extra_if_absent("latitude", json!(lat));
        }
        if let Some(lng) = json_f64(result, &["longitude"]) {
            out.set_extra_if_absent("longitude", json!(lng));
        }
        if let Some(area) = area {
            out.set_extra_if_absent("postcode_area", json!(area));
        }
        if let Some(region) = region {
            out.set_extra_if_absent("postcode_region", json!(region));
        }
        Ok(Some(out))
    }
}

#[async_trait]
impl Provider for PostcodeLookup {
    fn provider_id(&self) -> &'static str {
        POSTCODE_LOOKUP
    }

    async fn enrich(
        &self,
        http: &HttpFetcher,
        ctx: &ProviderContext,
        current: &BusinessData,
    ) -> Option<BusinessData> {
        degrade(POSTCODE_LOOKUP, ctx, self.lookup(http, current).await)
    }
}

/// Text search then details against the places proxy.
#[derive(Debug, Clone)]
pub struct PlacesLookup {
    pub enabled: bool,
    pub base_url: String,
}

impl PlacesLookup {
    async fn lookup(
        &self,
        http: &HttpFetcher,
        current: &BusinessData,
    ) -> Result<Option<BusinessData>, ProviderError> {
        let Some(name) = text_or_none(&current.name) else {
            return Ok(None);
        };
        let query = join_query(&[Some(name.as_str()), non_empty(&current.postcode)]);

        let mut find_url = endpoint_url(&self.base_url, "find")?;
        find_url.query_pairs_mut().append_pair("q", &query);
        let found = http.fetch_json(find_url.as_str(), &[]).await?;

        // An unconfigured proxy looks exactly like an empty search.
        if json_str(&found, &["status"]) == Some(PLACES_NOT_CONFIGURED) {
            debug!("places proxy not configured");
            return Ok(None);
        }
        let Some(place_id) = found
            .get("candidates")
            .and_then(JsonValue::as_array)
            .and_then(|candidates| candidates.first())
            .and_then(|candidate| json_str(candidate, &["place_id"]))
        else {
            return Ok(None);
        };

        let mut details_url = endpoint_url(&self.base_url, "details")?;
        details_url.query_pairs_mut().append_pair("place_id", place_id);
        let details = http.fetch_json(details_url.as_str(), &[]).await?;
        if json_str(&details, &["status"]) == Some(PLACES_NOT_CONFIGURED) {
            return Ok(None);
        }
        let Some(result) = json_value(&details, &["result"]).filter(|r| r.is_object()) else {
            return Ok(None);
        };

        let mut out = current.clone();
        fill_text_if_empty(
            &mut out.phone,
            json_str(result, &["formatted_phone_number"]).and_then(text_or_none),
        );
        if let Some(website) = json_str(result, &["website"]) {
            out.set_extra_if_absent("website", json!(website));
        }
        if let Some(rating) = json_value(result, &["rating"]) {
            out.set_extra_if_absent("rating", rating.clone());
        }
        if let Some(count) = json_value(result, &["user_ratings_total"]) {
            out.set_extra_if_absent("rating_count", count.clone());
        }
        if let Some(text) = json_value(result, &["opening_hours", "weekday_text"]) {
            out.set_extra_if_absent("opening_hours_text", text.clone());
        }
        if let Some(lat) = json_f64(result, &["geometry", "location", "lat"]) {
            out.set_extra_if_absent("latitude", json!(lat));
        }
        if let Some(lng) = json_f64(result, &["geometry", "location", "lng"]) {
            out.set_extra_if_absent("longitude", json!(lng));
        }
        out.set_extra_if_absent("google_places", json!({ "place_id": place_id }));
        Ok(Some(out))
    }
}

#[async_trait]
impl Provider for PlacesLookup {
    fn provider_id(&self) -> &'static str {
        PLACES_LOOKUP
    }

    async fn enrich(
        &self,
        http: &HttpFetcher,
        ctx: &ProviderContext,
        current: &BusinessData,
    ) -> Option<BusinessData> {
        if !self.enabled {
            return None;
        }
        degrade(PLACES_LOOKUP, ctx, self.lookup(http, current).await)
    }
}

#[derive(Debug, Clone)]
pub struct GazetteerLookup {
    pub endpoint: String,
    pub contact_email: String,
    pub accept_language: String,
}

fn opening_range_regex() -> &'static Regex {
    static RANGE: OnceLock<Regex> = OnceLock::new();
    RANGE.get_or_init(|| {
        Regex::new(r"(\d{1,2}):(\d{2})\s*[-–]\s*(\d{1,2}):(\d{2})")
            .expect("opening-hours range regex is valid")
    })
}

/// Reads the first `HH:MM-HH:MM` range out of a free-text `opening_hours` tag
/// and applies it to every day of the week.
///
/// This deliberately ignores day selectors and any further ranges, so
/// `"Mo-Fr 09:00-17:00; Sa 10:00-14:00"` becomes 09:00-17:00 all week.
pub fn parse_single_range(tag: &str) -> Option<OpeningHours> {
    let caps = opening_range_regex().captures(tag)?;
    let open = format!("{:0>2}:{}", &caps[1], &caps[2]);
    let close = format!("{:0>2}:{}", &caps[3], &caps[4]);
    Some(OpeningHours::uniform(&open, &close))
}

fn tag_text(tags: Option<&JsonValue>, variants: &[&str]) -> Option<String> {
    let tags = tags?;
    variants
        .iter()
        .find_map(|key| json_str(tags, &[*key]).and_then(text_or_none))
}

fn street_address(address: &JsonValue) -> Option<String> {
    let road = json_str(address, &["road"]).and_then(text_or_none)?;
    match json_str(address, &["house_number"]).and_then(text_or_none) {
        Some(number) => Some(format!("{number} {road}")),
        None => Some(road),
    }
}

impl GazetteerLookup {
    async fn lookup(
        &self,
        http: &HttpFetcher,
        current: &BusinessData,
    ) -> Result<Option<BusinessData>, ProviderError> {
        let Some(name) = text_or_none(&current.name) else {
            return Ok(None);
        };
        let query = join_query(&[
            Some(name.as_str()),
            non_empty(&current.postcode),
            non_empty(&current.town),
        ]);

        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| ProviderError::Message(format!("bad endpoint {}: {e}", self.endpoint)))?;
        url.query_pairs_mut()
            .append_pair("q", &query)
            .append_pair("format", "json")
            .append_pair("addressdetails", "1")
            .append_pair("extratags", "1")
            .append_pair("limit", "1")
            .append_pair("email", &self.contact_email);

        let body = http
            .fetch_json(url.as_str(), &[("Accept-Language", self.accept_language.as_str())])
            .await?;
        let Some(place) = body.as_array().and_then(|matches| matches.first()) else {
            return Ok(None);
        };

        let tags = place.get("extratags").filter(|t| t.is_object());
        let mut out = current.clone();
        fill_text_if_empty(&mut out.phone, tag_text(tags, &["phone", "contact:phone"]));
        fill_text_if_empty(&mut out.email, tag_text(tags, &["email", "contact:email"]));
        if let Some(website) = tag_text(tags, &["website", "contact:website"]) {
            out.set_extra_if_absent("website", json!(website));
        }
        if out.opening_hours.is_none() {
            out.opening_hours = tag_text(tags, &["opening_hours"])
                .as_deref()
                .and_then(parse_single_range);
        }

        if let Some(address) = place.get("address").filter(|a| a.is_object()) {
            fill_text_if_empty(&mut out.address, street_address(address));
            fill_text_if_empty(
                &mut out.town,
                ["city", "town", "village", "hamlet", "suburb"]
                    .iter()
                    .find_map(|key| json_str(address, &[*key]).and_then(text_or_none)),
            );
            fill_text_if_empty(
                &mut out.postcode,
                json_str(address, &["postcode"]).and_then(text_or_none),
            );
        }

        if let Some(osm_id) = json_value(place, &["osm_id"]) {
            out.set_extra_if_absent("osm_id", osm_id.clone());
        }
        if let Some(osm_type) = json_value(place, &["osm_type"]) {
            out.set_extra_if_absent("osm_type", osm_type.clone());
        }
        Ok(Some(out))
    }
}

#[async_trait]
impl Provider for GazetteerLookup {
    fn provider_id(&self) -> &'static str {
        GAZETTEER_LOOKUP
    }

    async fn enrich(
        &self,
        http: &HttpFetcher,
        ctx: &ProviderContext,
        current: &BusinessData,
    ) -> Option<BusinessData> {
        degrade(GAZETTEER_LOOKUP, ctx, self.lookup(http, current).await)
    }
}

/// Name words that mark a venue as a pub for default hours.
pub const PUB_KEYWORDS: [&str; 8] = [
    "pub", "bar", "inn", "tavern", "arms", "crown", "alehouse", "taproom",
];

pub const PUB_HOURS: (&str, &str) = ("11:00", "23:00");
pub const DEFAULT_HOURS: (&str, &str) = ("09:00", "17:00");

/// Whole-word, case-insensitive keyword match ("Barber" is not a bar).
pub fn looks_like_pub(name: &str) -> bool {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .any(|word| PUB_KEYWORDS.contains(&word.to_lowercase().as_str()))
}

pub fn default_opening_hours(name: &str) -> OpeningHours {
    let (open, close) = if looks_like_pub(name) {
        PUB_HOURS
    } else {
        DEFAULT_HOURS
    };
    OpeningHours::uniform(open, close)
}

/// Network-free last resort: guarantees a schedule exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackHeuristic;

impl FallbackHeuristic {
    pub fn apply(&self, current: &BusinessData) -> Option<BusinessData> {
        if current.opening_hours.is_some() {
            return None;
        }
        let mut out = current.clone();
        out.opening_hours = Some(default_opening_hours(&current.name));
        Some(out)
    }
}

#[async_trait]
impl Provider for FallbackHeuristic {
    fn provider_id(&self) -> &'static str {
        FALLBACK_HEURISTIC
    }

    async fn enrich(
        &self,
        _http: &HttpFetcher,
        _ctx: &ProviderContext,
        current: &BusinessData,
    ) -> Option<BusinessData> {
        self.apply(current)
    }
}

pub fn postcode_lookup(settings: &ProviderSettings) -> PostcodeLookup {
    PostcodeLookup {
        endpoint: settings.postcodes_url.clone(),
    }
}

pub fn places_lookup(settings: &ProviderSettings) -> PlacesLookup {
    PlacesLookup {
        enabled: settings.places_enabled,
        base_url: settings.places_url.clone(),
    }
}

pub fn gazetteer_lookup(settings: &ProviderSettings) -> GazetteerLookup {
    GazetteerLookup {
        endpoint: settings.gazetteer_url.clone(),
        contact_email: settings.contact_email.clone(),
        accept_language: settings.accept_language.clone(),
    }
}

pub fn provider_for_id(provider_id: &str, settings: &ProviderSettings) -> Option<Arc<dyn Provider>> {
    match provider_id {
        POSTCODE_LOOKUP => Some(Arc::new(postcode_lookup(settings))),
        PLACES_LOOKUP => Some(Arc::new(places_lookup(settings))),
        GAZETTEER_LOOKUP => Some(Arc::new(gazetteer_lookup(settings))),
        FALLBACK_HEURISTIC => Some(Arc::new(FallbackHeuristic)),
        _ => None,
    }
}

pub fn default_chain(settings: &ProviderSettings) -> Vec<Arc<dyn Provider>> {
    DEFAULT_CHAIN
        .iter()
        .filter_map(|id| provider_for_id(id, settings))
        .collect()
}

/// Builds a seed from a loosely-typed upstream entity.
///
/// Accepts `postcode|zip`, `town|city`, `address|street`, `phone|telephone`
/// and `sources|sourceLists`. Blank strings count as absent; a missing name
/// becomes the empty string.
pub fn seed_from_value(value: &JsonValue) -> BusinessData {
    let mut seed = BusinessData::new(first_text(value, &["name"]).unwrap_or_default());
    seed.postcode = first_text(value, &["postcode", "zip"]);
    seed.town = first_text(value, &["town", "city"]);
    seed.address = first_text(value, &["address", "street"]);
    seed.phone = first_text(value, &["phone", "telephone"]);
    seed.email = first_text(value, &["email"]);
    seed.notes = first_text(value, &["notes"]);
    seed.opening_hours = value
        .get("openingHours")
        .and_then(|hours| serde_json::from_value(hours.clone()).ok());
    seed.sources = ["sources", "sourceLists"]
        .iter()
        .filter_map(|key| value.get(*key).and_then(JsonValue::as_array))
        .find(|tags| !tags.is_empty())
        .map(|tags| tags.iter().filter_map(source_tag_from_value).collect())
        .unwrap_or_default();
    if let Some(extras) = value.get("extras").and_then(JsonValue::as_object) {
        seed.extras = extras
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
    }
    seed
}

fn source_tag_from_value(value: &JsonValue) -> Option<SourceTag> {
    let list_name = first_text(value, &["listName", "list_name", "list"])?;
    let row = match value.get("row")? {
        JsonValue::Number(n) => u32::try_from(n.as_u64()?).ok()?,
        JsonValue::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    Some(SourceTag::new(list_name, row))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use venrich_storage::{FixtureTransport, HttpClientConfig};

    const POSTCODES: &str = "https://api.postcodes.io/postcodes";
    const PLACES: &str = "http://localhost:8787/api/places";
    const GAZETTEER: &str = "https://nominatim.openstreetmap.org/search";

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(rel: &str) -> JsonValue {
        let path = workspace_root().join("fixtures").join(rel);
        let text = fs::read_to_string(&path).expect("read fixture");
        serde_json::from_str(&text).expect("parse fixture")
    }

    fn http(transport: &Arc<FixtureTransport>) -> HttpFetcher {
        HttpFetcher::with_transport(HttpClientConfig::default(), transport.clone())
    }

    fn crown() -> BusinessData {
        BusinessData::new("The Crown Inn").with_postcode("SW1A 1AA")
    }

    fn ctx() -> ProviderContext {
        ProviderContext::new("venue-1", crown())
    }

    fn settings() -> ProviderSettings {
        ProviderSettings {
            places_enabled: true,
            contact_email: "ops@venrich.example".to_string(),
            ..ProviderSettings::default()
        }
    }

    #[tokio::test]
    async fn postcode_lookup_fills_missing_geo_extras_only() {
        let transport = Arc::new(
            FixtureTransport::new().with_json(POSTCODES, fixture("postcodes/sw1a1aa.json")),
        );
        let mut current = crown();
        current.extras.insert("latitude".to_string(), json!(1.0));

        let out = postcode_lookup(&settings())
            .enrich(&http(&transport), &ctx(), &current)
            .await
            .unwrap();

        assert_eq!(out.extras["latitude"], json!(1.0));
        assert_eq!(out.extras["longitude"], json!(-0.141588));
        assert_eq!(out.extras["postcode_area"], json!("Westminster"));
        assert_eq!(out.extras["postcode_region"], json!("E99999999"));
        let calls = transport.calls().await;
        assert_eq!(calls[0].url, format!("{POSTCODES}/SW1A1AA"));
    }

    #[tokio::test]
    async fn postcode_lookup_without_postcode_makes_no_request() {
        let transport = Arc::new(FixtureTransport::new());
        let out = postcode_lookup(&settings())
            .enrich(&http(&transport), &ctx(), &BusinessData::new("The Crown Inn"))
            .await;
        assert!(out.is_none());
        assert!(transport.calls().await.is_empty());
    }

    #[tokio::test]
    async fn postcode_lookup_degrades_on_http_failure() {
        let transport = Arc::new(FixtureTransport::new().with_status(POSTCODES, 404));
        let out = postcode_lookup(&settings())
            .enrich(&http(&transport), &ctx(), &crown())
            .await;
        assert!(out.is_none());
        assert_eq!(transport.call_count(POSTCODES).await, 1);
    }

    #[tokio::test]
    async fn disabled_places_lookup_passes_through() {
        let transport = Arc::new(FixtureTransport::new());
        let provider = PlacesLookup {
            enabled: false,
            base_url: PLACES.to_string(),
        };
        assert!(provider
            .enrich(&http(&transport), &ctx(), &crown())
            .await
            .is_none());
        assert!(transport.calls().await.is_empty());
    }

    #[tokio::test]
    async fn unconfigured_places_proxy_reads_as_no_results() {
        let transport = Arc::new(
            FixtureTransport::new()
                .with_json(format!("{PLACES}/find"), fixture("places/not_configured.json")),
        );
        let out = places_lookup(&settings())
            .enrich(&http(&transport), &ctx(), &crown())
            .await;
        assert!(out.is_none());
        assert_eq!(transport.call_count(&format!("{PLACES}/details")).await, 0);
    }

    #[tokio::test]
    async fn places_lookup_searches_then_reads_details() {
        let transport = Arc::new(
            FixtureTransport::new()
                .with_json(format!("{PLACES}/find"), fixture("places/find_crown.json"))
                .with_json(format!("{PLACES}/details"), fixture("places/details_crown.json")),
        );
        let mut current = crown();
        current.extras.insert("latitude".to_string(), json!(51.501009));

        let out = places_lookup(&settings())
            .enrich(&http(&transport), &ctx(), &current)
            .await
            .unwrap();

        assert_eq!(out.phone.as_deref(), Some("020 7930 0001"));
        assert_eq!(out.extras["website"], json!("https://thecrowninn.example"));
        assert_eq!(out.extras["rating"], json!(4.4));
        assert_eq!(out.extras["rating_count"], json!(812));
        assert_eq!(out.extras["opening_hours_text"][0], json!("Monday: 11:00 AM - 11:00 PM"));
        assert_eq!(out.extras["latitude"], json!(51.501009));
        assert_eq!(out.extras["longitude"], json!(-0.1419));
        assert_eq!(out.extras["google_places"], json!({"place_id": "ChIJcrown0001"}));

        let calls = transport.calls().await;
        assert_eq!(calls[0].url, format!("{PLACES}/find?q=The+Crown+Inn%2C+SW1A+1AA"));
        assert_eq!(calls[1].url, format!("{PLACES}/details?place_id=ChIJcrown0001"));
    }

    #[tokio::test]
    async fn places_lookup_keeps_user_phone() {
        let transport = Arc::new(
            FixtureTransport::new()
                .with_json(format!("{PLACES}/find"), fixture("places/find_crown.json"))
                .with_json(format!("{PLACES}/details"), fixture("places/details_crown.json")),
        );
        let mut current = crown();
        current.phone = Some("07700 900000".to_string());

        let out = places_lookup(&settings())
            .enrich(&http(&transport), &ctx(), &current)
            .await
            .unwrap();
        assert_eq!(out.phone.as_deref(), Some("07700 900000"));
    }

    #[tokio::test]
    async fn places_details_not_configured_is_a_no_op() {
        let transport = Arc::new(
            FixtureTransport::new()
                .with_json(format!("{PLACES}/find"), fixture("places/find_crown.json"))
                .with_json(format!("{PLACES}/details"), fixture("places/not_configured.json")),
        );
        let out = places_lookup(&settings())
            .enrich(&http(&transport), &ctx(), &crown())
            .await;
        assert!(out.is_none());
        assert_eq!(transport.call_count(&format!("{PLACES}/details")).await, 1);
    }

    #[tokio::test]
    async fn places_lookup_with_no_candidates_is_a_no_op() {
        let transport = Arc::new(
            FixtureTransport::new()
                .with_json(format!("{PLACES}/find"), json!({"status": "ZERO_RESULTS", "candidates": []})),
        );
        let out = places_lookup(&settings())
            .enrich(&http(&transport), &ctx(), &crown())
            .await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn gazetteer_lookup_extracts_contact_address_and_hours() {
        let transport = Arc::new(
            FixtureTransport::new().with_json(GAZETTEER, fixture("gazetteer/crown.json")),
        );
        let mut current = crown();
        current.town = Some("London".to_string());

        let out = gazetteer_lookup(&settings())
            .enrich(&http(&transport), &ctx(), &current)
            .await
            .unwrap();

        assert_eq!(out.phone.as_deref(), Some("+44 20 7930 0002"));
        assert_eq!(out.email.as_deref(), Some("landlord@thecrowninn.example"));
        assert_eq!(out.address.as_deref(), Some("12 Whitehall"));
        assert_eq!(out.town.as_deref(), Some("London"));
        assert_eq!(out.opening_hours, Some(OpeningHours::uniform("11:00", "23:00")));
        assert_eq!(out.extras["website"], json!("https://crown-osm.example"));
        assert_eq!(out.extras["osm_id"], json!(2104567890u64));
        assert_eq!(out.extras["osm_type"], json!("node"));

        let calls = transport.calls().await;
        assert_eq!(
            calls[0].url,
            format!(
                "{GAZETTEER}?q=The+Crown+Inn%2C+SW1A+1AA%2C+London&format=json&addressdetails=1\
                 &extratags=1&limit=1&email=ops%40venrich.example"
            )
        );
        assert_eq!(
            calls[0].headers,
            vec![("Accept-Language".to_string(), "en-GB".to_string())]
        );
    }

    #[tokio::test]
    async fn gazetteer_query_always_carries_the_contact_email_param() {
        let transport = Arc::new(FixtureTransport::new().with_json(GAZETTEER, json!([])));
        gazetteer_lookup(&ProviderSettings::default())
            .enrich(&http(&transport), &ctx(), &crown())
            .await;
        let calls = transport.calls().await;
        assert_eq!(
            calls[0].url,
            format!(
                "{GAZETTEER}?q=The+Crown+Inn%2C+SW1A+1AA&format=json&addressdetails=1\
                 &extratags=1&limit=1&email="
            )
        );
    }

    #[tokio::test]
    async fn gazetteer_lookup_with_empty_result_is_a_no_op() {
        let transport = Arc::new(FixtureTransport::new().with_json(GAZETTEER, json!([])));
        let out = gazetteer_lookup(&settings())
            .enrich(&http(&transport), &ctx(), &crown())
            .await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn gazetteer_lookup_treats_malformed_body_as_no_data() {
        let transport =
            Arc::new(FixtureTransport::new().with_json(GAZETTEER, json!({"error": "nope"})));
        let out = gazetteer_lookup(&settings())
            .enrich(&http(&transport), &ctx(), &crown())
            .await;
        assert!(out.is_none());
    }

    #[test]
    fn single_range_parser_replicates_first_range() {
        assert_eq!(
            parse_single_range("Mo-Su 11:00-23:00"),
            Some(OpeningHours::uniform("11:00", "23:00"))
        );
        assert_eq!(
            parse_single_range("Mo-Fr 9:00–17:30; Sa 10:00-14:00"),
            Some(OpeningHours::uniform("09:00", "17:30"))
        );
        assert_eq!(parse_single_range("24/7"), None);
    }

    #[test]
    fn pub_names_get_pub_hours() {
        for name in ["The Crown", "Kings Arms", "Red Lion Inn", "BAR 54"] {
            assert_eq!(
                default_opening_hours(name),
                OpeningHours::uniform("11:00", "23:00"),
                "{name}"
            );
        }
        for name in ["Corner Bakery", "Barber Shop", "Innovation Hub"] {
            assert_eq!(
                default_opening_hours(name),
                OpeningHours::uniform("09:00", "17:00"),
                "{name}"
            );
        }
    }

    #[test]
    fn fallback_is_idempotent_once_hours_exist() {
        let first = FallbackHeuristic.apply(&crown()).unwrap();
        assert!(FallbackHeuristic.apply(&first).is_none());

        let mut custom = crown();
        custom.opening_hours = Some(OpeningHours::uniform("16:00", "22:00"));
        assert!(FallbackHeuristic.apply(&custom).is_none());
    }

    #[test]
    fn fallback_hours_answer_is_open_at() {
        use chrono::NaiveDate;
        let out = FallbackHeuristic.apply(&crown()).unwrap();
        let noon = NaiveDate::from_ymd_opt(2026, 10, 18)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let late = noon.date().and_hms_opt(23, 30, 0).unwrap();
        assert!(out.is_open_at(&noon));
        assert!(!out.is_open_at(&late));
    }

    #[test]
    fn registry_builds_default_chain_in_order() {
        let chain = default_chain(&ProviderSettings::default());
        let ids: Vec<_> = chain.iter().map(|p| p.provider_id()).collect();
        assert_eq!(ids, DEFAULT_CHAIN.to_vec());
        assert!(provider_for_id("yelp", &ProviderSettings::default()).is_none());
    }

    #[test]
    fn seed_adapter_reads_aliases_and_sources() {
        let seed = seed_from_value(&json!({
            "name": "The Crown Inn",
            "zip": "SW1A1AA",
            "city": "London",
            "street": "",
            "sourceLists": [
                {"listName": "london-pubs", "row": 4},
                {"listName": "london-pubs", "row": "9"},
                {"listName": "london-pubs", "row": -1}
            ]
        }));

        assert_eq!(seed.name, "The Crown Inn");
        assert_eq!(seed.postcode.as_deref(), Some("SW1A1AA"));
        assert_eq!(seed.town.as_deref(), Some("London"));
        assert_eq!(seed.address, None);
        assert_eq!(
            seed.sources,
            vec![SourceTag::new("london-pubs", 4), SourceTag::new("london-pubs", 9)]
        );
        assert!(seed.extras.is_empty());
    }

    #[test]
    fn seed_adapter_prefers_primary_keys_and_defaults_name() {
        let seed = seed_from_value(&json!({
            "postcode": "N1 9GU",
            "zip": "ignored",
            "openingHours": {"weekly": [null, ["10:00", "18:00"], null, null, null, null, null]}
        }));
        assert_eq!(seed.name, "");
        assert_eq!(seed.postcode.as_deref(), Some("N1 9GU"));
        assert_eq!(
            seed.opening_hours.unwrap().day(1),
            Some(&("10:00".to_string(), "18:00".to_string()))
        );
    }
}
