//! Evidence source contracts + the search-service, chat-completion and fixture implementations.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use brec_core::{Classification, Evidence, FieldLayout};
use brec_storage::{FetchError, HttpClientConfig, JsonHttpClient};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "brec-sources";

pub const DEFAULT_PERPLEXICA_ENDPOINT: &str = "http://localhost:3000";
pub const DEFAULT_PERPLEXITY_ENDPOINT: &str = "https://api.perplexity.ai";
pub const DEFAULT_CHAT_MODEL: &str = "openai/gpt-4o-mini";
pub const DEFAULT_EMBEDDING_MODEL: &str = "openai/text-embedding-3-large";
pub const DEFAULT_REVIEW_MODEL: &str = "sonar";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Perplexica,
    Perplexity,
    Fixture,
}

/// Which pipeline stages a source feeds: `Primary` for verify/discover, `Reviewer` for the final pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRole {
    Primary,
    Reviewer,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSpec {
    pub source_id: String,
    pub role: SourceRole,
    pub kind: SourceKind,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport failure: {0}")]
    Transport(#[from] FetchError),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("source {source_id} does not support {operation}")]
    Unsupported {
        source_id: String,
        operation: &'static str,
    },
    #[error("no fixture response for {0}")]
    MissingFixture(String),
}

/// Raw answer text plus the assertions decoded from it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceReply {
    pub raw: String,
    pub evidence: Evidence,
}

impl SourceReply {
    pub fn decode(raw: String, layout: FieldLayout) -> Self {
        let evidence = Evidence::from_response(&raw, layout);
        Self { raw, evidence }
    }
}

#[async_trait]
pub trait EvidenceSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Score each listed brand's ownership by `holding` (`brand:confidence` lines).
    async fn verify(&self, holding: &str, brands: &[String]) -> Result<SourceReply, SourceError>;

    /// Every brand the source attributes to `holding` (`brand:confidence:sector:department`).
    async fn discover(&self, _holding: &str) -> Result<SourceReply, SourceError> {
        Err(SourceError::Unsupported {
            source_id: self.source_id().to_string(),
            operation: "discover",
        })
    }

    async fn classify(&self, _brand: &str) -> Result<Classification, SourceError> {
        Err(SourceError::Unsupported {
            source_id: self.source_id().to_string(),
            operation: "classify",
        })
    }
}

/// Read a single `sector:department` answer. Anything unusable maps to unknown.
pub fn parse_classification(text: &str) -> Classification {
    text.lines()
        .map(|line| line.trim().trim_start_matches(['-', '*', '•']).trim())
        .find(|line| line.contains(':'))
        .and_then(|line| line.rsplit('→').next())
        .and_then(|line| line.split_once(':'))
        .map(|(sector, department)| Classification::new(sector, department))
        .unwrap_or_else(Classification::unknown)
}

const VERIFY_INSTRUCTIONS: &str = "Tu vérifies l'appartenance de marques commerciales à des groupes \
industriels ou financiers en France. N'utilise que des sources officielles ou institutionnelles \
(rapports annuels, sites corporate, registres publics). Pour chaque marque, réponds sur une seule \
ligne au format `marque:score`, où le score va de 0 (aucune information fiable) à 1 (preuve \
officielle). Indique `NaN` si aucune donnée n'est trouvée. Garde l'ordre et l'orthographe des \
marques, sans aucun autre texte.";

const DISCOVER_INSTRUCTIONS: &str = "Tu identifies toutes les marques détenues actuellement par un \
groupe donné. N'utilise que des sources officielles ou vérifiables. Pour chaque marque, réponds \
sur une seule ligne au format `marque:score:secteur:département`, le score allant de 0 à 1. \
Exemple : `Seven Up:0.9:FMCG:Liquides`. Utilise `Unknown` pour un secteur ou un département \
inconnu. Trie par score décroissant, sans aucun autre texte.";

const CLASSIFY_INSTRUCTIONS: &str = "Tu classes une marque commerciale par secteur d'activité \
(FMCG, Technology, Automotive, Fashion...) et département (Liquides, Alimentaire, Electronics...). \
Réponds sur une seule ligne au format `secteur:département`, ou `Unknown:Unknown` si l'information \
n'est pas fiable, sans aucun autre texte.";

const REVIEW_SYSTEM_PROMPT: &str = "Tu es un expert en vérification de l'appartenance des marques \
commerciales à des groupes industriels ou financiers. Réponds uniquement au format demandé.";

fn verify_query(holding: &str, brands: &[String]) -> String {
    format!(
        "Pour le groupe {holding}, vérifie si les marques suivantes lui appartiennent bien : {}.",
        brands.join(", ")
    )
}

fn review_query(holding: &str, brands: &[String]) -> String {
    format!(
        "{}\n\nPour chaque marque, retourne une seule ligne `marque:score`, le score allant de 0 \
         (aucune information fiable) à 1 (preuve officielle confirmée). Respecte l'ordre des \
         marques et n'ajoute aucun commentaire.",
        verify_query(holding, brands)
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct ModelRef {
    provider: String,
    name: String,
}

impl ModelRef {
    /// `provider/name`; a bare name is assumed to be an OpenAI model.
    fn parse(spec: &str) -> Self {
        match spec.split_once('/') {
            Some((provider, name)) => Self {
                provider: provider.to_string(),
                name: name.to_string(),
            },
            None => Self {
                provider: "openai".to_string(),
                name: spec.to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest<'a> {
    chat_model: &'a ModelRef,
    embedding_model: &'a ModelRef,
    optimization_mode: &'static str,
    focus_mode: &'static str,
    query: String,
    system_instructions: &'static str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    message: Option<String>,
}

/// Web-search answer engine backing the verify and discover stages.
#[derive(Debug, Clone)]
pub struct PerplexicaSource {
    source_id: String,
    search_url: String,
    chat_model: ModelRef,
    embedding_model: ModelRef,
    http: JsonHttpClient,
}

impl PerplexicaSource {
    pub fn new(
        source_id: impl Into<String>,
        endpoint: &str,
        chat_model: &str,
        embedding_model: &str,
        http: JsonHttpClient,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            search_url: format!("{}/api/search", endpoint.trim_end_matches('/')),
            chat_model: ModelRef::parse(chat_model),
            embedding_model: ModelRef::parse(embedding_model),
            http,
        }
    }

    async fn search(&self, query: String, instructions: &'static str) -> Result<String, SourceError> {
        let request = SearchRequest {
            chat_model: &self.chat_model,
            embedding_model: &self.embedding_model,
            optimization_mode: "balanced",
            focus_mode: "webSearch",
            query,
            system_instructions: instructions,
            stream: false,
        };
        let value = self.http.post_json(&self.search_url, None, &request).await?;
        let response: SearchResponse = decode_body(value)?;
        response
            .message
            .ok_or_else(|| SourceError::Malformed("missing `message` field".to_string()))
    }
}

#[async_trait]
impl EvidenceSource for PerplexicaSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn verify(&self, holding: &str, brands: &[String]) -> Result<SourceReply, SourceError> {
        let raw = self.search(verify_query(holding, brands), VERIFY_INSTRUCTIONS).await?;
        Ok(SourceReply::decode(raw, FieldLayout::Scored))
    }

    async fn discover(&self, holding: &str) -> Result<SourceReply, SourceError> {
        let query = format!(
            "Pour le groupe {holding}, liste absolument toutes les marques qui lui appartiennent \
             actuellement avec leur secteur d'activité et leur département."
        );
        let raw = self.search(query, DISCOVER_INSTRUCTIONS).await?;
        Ok(SourceReply::decode(raw, FieldLayout::Classified))
    }

    async fn classify(&self, brand: &str) -> Result<Classification, SourceError> {
        let query = format!(
            "Pour la marque {brand}, identifie son secteur d'activité et son département."
        );
        let raw = self.search(query, CLASSIFY_INSTRUCTIONS).await?;
        Ok(parse_classification(&raw))
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Independent chat-completion reviewer used only for the final re-verification pass.
#[derive(Debug, Clone)]
pub struct PerplexitySource {
    source_id: String,
    completions_url: String,
    model: String,
    api_key: String,
    http: JsonHttpClient,
}

impl PerplexitySource {
    pub fn new(
        source_id: impl Into<String>,
        endpoint: &str,
        model: &str,
        api_key: impl Into<String>,
        http: JsonHttpClient,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            completions_url: format!("{}/chat/completions", endpoint.trim_end_matches('/')),
            model: model.to_string(),
            api_key: api_key.into(),
            http,
        }
    }
}

#[async_trait]
impl EvidenceSource for PerplexitySource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn verify(&self, holding: &str, brands: &[String]) -> Result<SourceReply, SourceError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: REVIEW_SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: review_query(holding, brands),
                },
            ],
        };
        let value = self
            .http
            .post_json(&self.completions_url, Some(&self.api_key), &request)
            .await?;
        let response: ChatResponse = decode_body(value)?;
        let raw = response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| SourceError::Malformed("response has no choices".to_string()))?;
        Ok(SourceReply::decode(raw, FieldLayout::Scored))
    }
}

fn decode_body<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, SourceError> {
    serde_json::from_value(value).map_err(|e| SourceError::Malformed(e.to_string()))
}

/// Canned responses keyed by holding (verify, discover) or brand (classify).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FixtureBook {
    #[serde(default)]
    pub verify: HashMap<String, String>,
    #[serde(default)]
    pub discover: HashMap<String, String>,
    #[serde(default)]
    pub classify: HashMap<String, String>,
}

pub fn load_fixture_book(path: impl AsRef<Path>) -> Result<FixtureBook> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Offline source replaying a fixture book. A missing entry behaves like a failed query.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    source_id: String,
    book: FixtureBook,
}

impl FixtureSource {
    pub fn new(source_id: impl Into<String>, book: FixtureBook) -> Self {
        Self {
            source_id: source_id.into(),
            book,
        }
    }

    fn lookup<'a>(
        map: &'a HashMap<String, String>,
        operation: &str,
        key: &str,
    ) -> Result<&'a str, SourceError> {
        map.get(key)
            .map(String::as_str)
            .ok_or_else(|| SourceError::MissingFixture(format!("{operation} `{key}`")))
    }
}

#[async_trait]
impl EvidenceSource for FixtureSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn verify(&self, holding: &str, brands: &[String]) -> Result<SourceReply, SourceError> {
        debug!(source_id = %self.source_id, holding, brands = brands.len(), "fixture verify");
        let raw = Self::lookup(&self.book.verify, "verify", holding)?;
        Ok(SourceReply::decode(raw.to_string(), FieldLayout::Scored))
    }

    async fn discover(&self, holding: &str) -> Result<SourceReply, SourceError> {
        let raw = Self::lookup(&self.book.discover, "discover", holding)?;
        Ok(SourceReply::decode(raw.to_string(), FieldLayout::Classified))
    }

    async fn classify(&self, brand: &str) -> Result<Classification, SourceError> {
        let raw = Self::lookup(&self.book.classify, "classify", brand)?;
        Ok(parse_classification(raw))
    }
}

/// Shared inputs for building sources from their specs.
#[derive(Debug, Clone, Default)]
pub struct SourceContext {
    pub workspace_root: PathBuf,
    pub http: HttpClientConfig,
    pub perplexity_api_key: Option<String>,
}

pub fn source_from_spec(spec: &SourceSpec, ctx: &SourceContext) -> Result<Box<dyn EvidenceSource>> {
    match spec.kind {
        SourceKind::Perplexica => {
            let http = JsonHttpClient::new(ctx.http.clone())?;
            Ok(Box::new(PerplexicaSource::new(
                spec.source_id.clone(),
                spec.endpoint.as_deref().unwrap_or(DEFAULT_PERPLEXICA_ENDPOINT),
                spec.model.as_deref().unwrap_or(DEFAULT_CHAT_MODEL),
                spec.embedding_model.as_deref().unwrap_or(DEFAULT_EMBEDDING_MODEL),
                http,
            )))
        }
        SourceKind::Perplexity => {
            let api_key = ctx
                .perplexity_api_key
                .as_deref()
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .with_context(|| {
                    format!("source {} needs PERPLEXITY_API_KEY", spec.source_id)
                })?;
            let http = JsonHttpClient::new(ctx.http.clone())?;
            Ok(Box::new(PerplexitySource::new(
                spec.source_id.clone(),
                spec.endpoint.as_deref().unwrap_or(DEFAULT_PERPLEXITY_ENDPOINT),
                spec.model.as_deref().unwrap_or(DEFAULT_REVIEW_MODEL),
                api_key,
                http,
            )))
        }
        SourceKind::Fixture => {
            let rel = spec
                .fixture_path
                .as_ref()
                .with_context(|| format!("fixture source {} has no fixture_path", spec.source_id))?;
            let book = load_fixture_book(ctx.workspace_root.join(rel))?;
            Ok(Box::new(FixtureSource::new(spec.source_id.clone(), book)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brec_storage::BackoffPolicy;
    use httpmock::prelude::*;
    use std::time::Duration;

    fn client() -> JsonHttpClient {
        JsonHttpClient::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: None,
            backoff: BackoffPolicy::none(),
        })
        .unwrap()
    }

    fn brands(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn classification_answers_are_read_leniently() {
        assert_eq!(parse_classification("FMCG:Liquides"), Classification::new("FMCG", "Liquides"));
        assert_eq!(
            parse_classification("Classement\n- Seven Up → FMCG:Liquides"),
            Classification::new("FMCG", "Liquides")
        );
        assert_eq!(
            parse_classification("- Seven Up → FMCG : Liquides\n"),
            Classification::new("FMCG", "Liquides")
        );
        assert_eq!(parse_classification("no idea"), Classification::unknown());
        assert_eq!(parse_classification("Unknown:Unknown"), Classification::unknown());
    }

    #[test]
    fn model_refs_split_provider() {
        assert_eq!(
            ModelRef::parse("openai/gpt-4o-mini"),
            ModelRef {
                provider: "openai".into(),
                name: "gpt-4o-mini".into()
            }
        );
        assert_eq!(ModelRef::parse("sonar").provider, "openai");
    }

    #[tokio::test]
    async fn search_source_reads_message_field() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/search");
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(serde_json::json!({
                        "message": "Widgetco:0.8\nGadget:0.2",
                        "sources": []
                    }));
            })
            .await;

        let source = PerplexicaSource::new(
            "search",
            &server.base_url(),
            DEFAULT_CHAT_MODEL,
            DEFAULT_EMBEDDING_MODEL,
            client(),
        );
        let reply = source.verify("Acme", &brands(&["Widgetco", "Gadget"])).await.unwrap();
        assert_eq!(reply.evidence.assertions.len(), 2);
        assert_eq!(reply.evidence.assertions[0].confidence, Some(0.8));
        assert_eq!(reply.raw, "Widgetco:0.8\nGadget:0.2");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn search_source_without_message_is_malformed() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/search");
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(serde_json::json!({"error": "model unavailable"}));
            })
            .await;

        let source = PerplexicaSource::new(
            "search",
            &server.base_url(),
            DEFAULT_CHAT_MODEL,
            DEFAULT_EMBEDDING_MODEL,
            client(),
        );
        let err = source.discover("Acme").await.unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));
    }

    #[tokio::test]
    async fn reviewer_sends_bearer_and_reads_first_choice() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .header("authorization", "Bearer pplx-test");
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(serde_json::json!({
                        "choices": [{"message": {"role": "assistant", "content": "- Widgetco: 0.5"}}]
                    }));
            })
            .await;

        let source = PerplexitySource::new(
            "review",
            &server.base_url(),
            DEFAULT_REVIEW_MODEL,
            "pplx-test",
            client(),
        );
        let reply = source.verify("Acme", &brands(&["Widgetco"])).await.unwrap();
        assert_eq!(reply.evidence.assertions[0].brand, "Widgetco");
        assert_eq!(reply.evidence.assertions[0].confidence, Some(0.5));
        mock.assert_async().await;

        let err = source.discover("Acme").await.unwrap_err();
        assert!(matches!(err, SourceError::Unsupported { operation: "discover", .. }));
    }

    #[tokio::test]
    async fn reviewer_http_failure_is_transport_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(401);
            })
            .await;
        let source = PerplexitySource::new("review", &server.base_url(), "sonar", "bad", client());
        let err = source.verify("Acme", &brands(&["Widgetco"])).await.unwrap_err();
        assert!(matches!(err, SourceError::Transport(FetchError::HttpStatus { status: 401, .. })));
    }

    #[tokio::test]
    async fn fixture_source_replays_book_and_reports_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.json");
        fs::write(
            &path,
            r#"{"verify": {"Acme": "Widgetco:0.8"},
                "discover": {"Acme": "NewBrand:0.6:FMCG:Snacks"},
                "classify": {"NewBrand": "FMCG:Snacks"}}"#,
        )
        .unwrap();

        let spec: SourceSpec = serde_json::from_value(serde_json::json!({
            "source_id": "offline",
            "role": "primary",
            "kind": "fixture",
            "fixture_path": "book.json"
        }))
        .unwrap();
        assert!(spec.enabled);
        let ctx = SourceContext {
            workspace_root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let source = source_from_spec(&spec, &ctx).unwrap();
        assert_eq!(source.source_id(), "offline");

        let verify = source.verify("Acme", &brands(&["Widgetco"])).await.unwrap();
        assert_eq!(verify.evidence.assertions[0].confidence, Some(0.8));
        let discover = source.discover("Acme").await.unwrap();
        assert_eq!(
            discover.evidence.assertions[0].classification,
            Classification::new("FMCG", "Snacks")
        );
        assert_eq!(source.classify("NewBrand").await.unwrap(), Classification::new("FMCG", "Snacks"));
        assert!(matches!(
            source.verify("Globex", &[]).await.unwrap_err(),
            SourceError::MissingFixture(_)
        ));
    }

    #[test]
    fn reviewer_source_requires_api_key() {
        let spec: SourceSpec = serde_json::from_value(serde_json::json!({
            "source_id": "review",
            "role": "reviewer",
            "kind": "perplexity"
        }))
        .unwrap();
        let err = source_from_spec(&spec, &SourceContext::default()).err().unwrap();
        assert!(err.to_string().contains("PERPLEXITY_API_KEY"));
    }
}
