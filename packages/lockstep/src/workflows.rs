//! Built-in workflow definitions.
//!
//! These are the platform's three sagas with simulated step handlers: the
//! orchestration (ordering, retries, idempotency keys, compensation) is
//! real, the external side effects are stand-ins that derive deterministic
//! results from their inputs.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::definition::{StepDefinition, StepHandler, WorkflowDefinition};

fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(&hasher.finalize()[..20])
}

// ============================================================================
// Contract deployment
// ============================================================================

struct ValidateContractCode;

#[async_trait]
impl StepHandler for ValidateContractCode {
    async fn execute(&self, input: &Value, _context: &Value) -> anyhow::Result<Value> {
        let code = input
            .get("contractCode")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        anyhow::ensure!(!code.is_empty(), "validation failed: contractCode is empty");
        anyhow::ensure!(
            code.starts_with("0x"),
            "validation failed: contractCode must be 0x-prefixed"
        );
        Ok(json!({ "valid": true, "codeHash": short_hash(code) }))
    }

    async fn compensate(&self, input: &Value, _output: &Value, _context: &Value) -> anyhow::Result<()> {
        info!(contract = ?input.get("contractName"), "validation artifacts discarded");
        Ok(())
    }
}

struct DeployContract;

#[async_trait]
impl StepHandler for DeployContract {
    async fn execute(&self, input: &Value, _context: &Value) -> anyhow::Result<Value> {
        let code_hash = input
            .get("validate_contract_code")
            .and_then(|v| v.get("codeHash"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let name = input
            .get("contractName")
            .and_then(|v| v.as_str())
            .unwrap_or("unnamed");

        let address = format!("0x{}", short_hash(&format!("addr:{code_hash}:{name}")));
        let tx_hash = format!("0x{}", short_hash(&format!("tx:{code_hash}:{name}")));
        Ok(json!({ "contractAddress": address, "transactionHash": tx_hash }))
    }

    async fn compensate(&self, _input: &Value, output: &Value, _context: &Value) -> anyhow::Result<()> {
        info!(
            address = ?output.get("contractAddress"),
            "deployed contract marked abandoned"
        );
        Ok(())
    }
}

struct VerifyContract;

#[async_trait]
impl StepHandler for VerifyContract {
    async fn execute(&self, input: &Value, _context: &Value) -> anyhow::Result<Value> {
        let address = input
            .get("deploy_contract")
            .and_then(|v| v.get("contractAddress"))
            .and_then(|v| v.as_str());
        anyhow::ensure!(address.is_some(), "validation failed: no contract address to verify");
        Ok(json!({ "verified": true, "contractAddress": address }))
    }

    async fn compensate(&self, _input: &Value, output: &Value, _context: &Value) -> anyhow::Result<()> {
        info!(address = ?output.get("contractAddress"), "verification record withdrawn");
        Ok(())
    }
}

struct IndexContract;

#[async_trait]
impl StepHandler for IndexContract {
    async fn execute(&self, input: &Value, _context: &Value) -> anyhow::Result<Value> {
        let address = input
            .get("deploy_contract")
            .and_then(|v| v.get("contractAddress"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok(json!({ "indexed": true, "searchKey": format!("contract:{address}") }))
    }
}

/// `validate_contract_code → deploy_contract → verify_contract →
/// index_contract`, with compensation on everything before indexing.
pub fn contract_deployment() -> WorkflowDefinition {
    WorkflowDefinition::new("contract_deployment")
        .step(
            StepDefinition::new("validate_contract_code", Arc::new(ValidateContractCode))
                .compensated(),
        )
        .step(
            StepDefinition::new("deploy_contract", Arc::new(DeployContract))
                .idempotent()
                .compensated(),
        )
        .step(StepDefinition::new("verify_contract", Arc::new(VerifyContract)).compensated())
        .step(StepDefinition::new("index_contract", Arc::new(IndexContract)))
}

// ============================================================================
// Speech synthesis
// ============================================================================

struct PrepareText;

#[async_trait]
impl StepHandler for PrepareText {
    async fn execute(&self, input: &Value, _context: &Value) -> anyhow::Result<Value> {
        let text = input.get("text").and_then(|v| v.as_str()).unwrap_or_default();
        let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
        anyhow::ensure!(!normalized.is_empty(), "validation failed: text is empty");
        Ok(json!({ "text": normalized, "characters": normalized.chars().count() }))
    }
}

struct SynthesizeAudio;

#[async_trait]
impl StepHandler for SynthesizeAudio {
    async fn execute(&self, input: &Value, _context: &Value) -> anyhow::Result<Value> {
        let prepared = input
            .get("prepare_text")
            .and_then(|v| v.get("text"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let characters = prepared.chars().count() as u64;
        // Rough speaking rate: ~15 characters per second.
        Ok(json!({
            "audioId": short_hash(prepared),
            "durationSeconds": (characters / 15).max(1),
        }))
    }
}

struct StoreAudio;

#[async_trait]
impl StepHandler for StoreAudio {
    async fn execute(&self, input: &Value, _context: &Value) -> anyhow::Result<Value> {
        let audio_id = input
            .get("synthesize_audio")
            .and_then(|v| v.get("audioId"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok(json!({ "url": format!("audio/{audio_id}.mp3") }))
    }

    async fn compensate(&self, _input: &Value, output: &Value, _context: &Value) -> anyhow::Result<()> {
        info!(url = ?output.get("url"), "stored audio removed");
        Ok(())
    }
}

/// `prepare_text → synthesize_audio → store_audio`.
pub fn speech_synthesis() -> WorkflowDefinition {
    WorkflowDefinition::new("speech_synthesis")
        .step(StepDefinition::new("prepare_text", Arc::new(PrepareText)))
        .step(StepDefinition::new("synthesize_audio", Arc::new(SynthesizeAudio)).idempotent())
        .step(StepDefinition::new("store_audio", Arc::new(StoreAudio)).compensated())
}

// ============================================================================
// Market news indexing
// ============================================================================

struct FetchArticle;

#[async_trait]
impl StepHandler for FetchArticle {
    async fn execute(&self, input: &Value, _context: &Value) -> anyhow::Result<Value> {
        let url = input.get("url").and_then(|v| v.as_str()).unwrap_or_default();
        anyhow::ensure!(!url.is_empty(), "validation failed: url is required");
        Ok(json!({ "articleId": short_hash(url), "url": url }))
    }
}

struct AnalyzeSentiment;

#[async_trait]
impl StepHandler for AnalyzeSentiment {
    async fn execute(&self, input: &Value, _context: &Value) -> anyhow::Result<Value> {
        let article_id = input
            .get("fetch_article")
            .and_then(|v| v.get("articleId"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        // Deterministic stand-in for a model call.
        let prefix = &article_id[..article_id.len().min(2)];
        let byte = u32::from_str_radix(prefix, 16).unwrap_or(128);
        let score = (byte as f64 / 255.0) * 2.0 - 1.0;
        Ok(json!({ "sentiment": score }))
    }
}

struct IndexArticle;

#[async_trait]
impl StepHandler for IndexArticle {
    async fn execute(&self, input: &Value, _context: &Value) -> anyhow::Result<Value> {
        let article_id = input
            .get("fetch_article")
            .and_then(|v| v.get("articleId"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok(json!({ "indexed": true, "searchKey": format!("news:{article_id}") }))
    }

    async fn compensate(&self, _input: &Value, output: &Value, _context: &Value) -> anyhow::Result<()> {
        info!(key = ?output.get("searchKey"), "article removed from index");
        Ok(())
    }
}

/// `fetch_article → analyze_sentiment → index_article`.
pub fn news_indexing() -> WorkflowDefinition {
    WorkflowDefinition::new("news_indexing")
        .step(StepDefinition::new("fetch_article", Arc::new(FetchArticle)))
        .step(StepDefinition::new("analyze_sentiment", Arc::new(AnalyzeSentiment)))
        .step(StepDefinition::new("index_article", Arc::new(IndexArticle)).compensated())
}
