//! Security service: permission validation, token-bucket rate limiting,
//! risk scoring, session lifecycle, IP blocking and audit logging.
//!
//! Every policy decision appends one audit entry and publishes one
//! `security.audit` event, denied decisions at elevated priority.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::Sha256;

use crate::config::SecurityConfig;
use crate::error::HandlerError;
use crate::events::{Event, EventBus};
use crate::graph::{PermissionScope, RiskLevel, SecurityContext, TaskNode};

const PASSWORD_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const SESSION_ID_LEN: usize = 32;
const DENIAL_THREAT_INCREMENT: f64 = 0.05;

/// Timestamped record of a policy decision. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub user_id: String,
    pub origin_ip: Option<String>,
    pub action: String,
    pub resource: String,
    pub allowed: bool,
    pub details: Value,
    pub is_authenticated: bool,
    pub mfa_verified: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PermissionCheck {
    pub valid: bool,
    pub missing: Vec<PermissionScope>,
    pub required: Vec<PermissionScope>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: f64,
    pub limit: u32,
    pub retry_after_seconds: Option<f64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskAssessment {
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    pub factors: Vec<String>,
    pub requires_approval: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionCheck {
    pub valid: bool,
    pub reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Filters for querying the audit log.
#[derive(Debug, Default, Clone)]
pub struct AuditQuery {
    pub user_id: Option<String>,
    pub action: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

struct SessionEntry {
    user_id: String,
    expires_at: DateTime<Utc>,
}

pub struct SecurityService {
    bus: Arc<EventBus>,
    config: SecurityConfig,
    buckets: DashMap<String, TokenBucket>,
    threat_scores: DashMap<String, f64>,
    blocked_ips: RwLock<HashSet<String>>,
    sessions: DashMap<String, SessionEntry>,
    audit_log: Mutex<Vec<AuditEntry>>,
}

impl SecurityService {
    pub fn new(bus: Arc<EventBus>, config: SecurityConfig) -> Self {
        Self {
            bus,
            config,
            buckets: DashMap::new(),
            threat_scores: DashMap::new(),
            blocked_ips: RwLock::new(HashSet::new()),
            sessions: DashMap::new(),
            audit_log: Mutex::new(Vec::new()),
        }
    }

    fn identifier(ctx: &SecurityContext) -> String {
        if !ctx.user_id.is_empty() {
            ctx.user_id.clone()
        } else if let Some(ip) = &ctx.origin_ip {
            ip.clone()
        } else {
            "anonymous".to_string()
        }
    }

    /// Every scope the node requires must be granted by the context.
    pub async fn validate_permissions(
        &self,
        node: &TaskNode,
        ctx: &SecurityContext,
    ) -> PermissionCheck {
        let missing: Vec<PermissionScope> = node
            .required_permissions
            .iter()
            .filter(|scope| !ctx.allowed_scopes.contains(scope))
            .copied()
            .collect();
        let valid = missing.is_empty();

        self.log_audit(
            ctx,
            "permission_check",
            &node.id,
            valid,
            json!({
                "required": node.required_permissions,
                "allowed": ctx.allowed_scopes,
                "missing": missing,
            }),
        )
        .await;

        let event = Event::new("security.permission_check", "security_service")
            .with_payload(json!({
                "node_id": node.id,
                "allowed": valid,
                "missing_permissions": missing,
            }))
            .with_priority(if valid { 0 } else { 1 });
        if let Err(err) = self.bus.publish(event).await {
            tracing::warn!(error = %err, "failed to publish permission check event");
        }

        PermissionCheck {
            valid,
            missing,
            required: node.required_permissions.clone(),
        }
    }

    /// Gate used by the handler runtime; a denial is terminal for the node.
    pub async fn enforce_permissions(
        &self,
        node: &TaskNode,
        ctx: &SecurityContext,
    ) -> Result<(), HandlerError> {
        let check = self.validate_permissions(node, ctx).await;
        if check.valid {
            Ok(())
        } else {
            Err(HandlerError::PermissionDenied {
                missing: check.missing,
            })
        }
    }

    /// Token-bucket rate limiting per user id (falling back to origin ip,
    /// then "anonymous"). The blocked-ip check precedes token consumption.
    pub async fn check_rate_limit(&self, ctx: &SecurityContext) -> RateDecision {
        let identifier = Self::identifier(ctx);
        let limit = self.config.max_requests_per_hour;

        let ip_blocked = ctx.origin_ip.as_ref().is_some_and(|ip| {
            self.blocked_ips
                .read()
                .expect("blocked ip lock")
                .contains(ip.as_str())
        });
        if ip_blocked {
            self.log_audit(
                ctx,
                "rate_limit_check",
                &identifier,
                false,
                json!({"reason": "ip_blocked", "ip": ctx.origin_ip}),
            )
            .await;
            return RateDecision {
                allowed: false,
                remaining: 0.0,
                limit,
                retry_after_seconds: None,
                reason: Some("ip_blocked".to_string()),
            };
        }

        let refill_rate = f64::from(limit) / 3600.0;
        let capacity = f64::from(limit);

        let mut bucket = self
            .buckets
            .entry(identifier.clone())
            .or_insert_with(|| TokenBucket {
                tokens: capacity,
                last_refill: Instant::now(),
            });

        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_rate).min(capacity);
        bucket.last_refill = Instant::now();

        if bucket.tokens < 1.0 {
            let retry_after = (1.0 - bucket.tokens) / refill_rate;
            let remaining = bucket.tokens;
            drop(bucket);

            *self.threat_scores.entry(identifier.clone()).or_insert(0.0) +=
                DENIAL_THREAT_INCREMENT;

            self.log_audit(
                ctx,
                "rate_limit_exceeded",
                &identifier,
                false,
                json!({"tokens_remaining": remaining}),
            )
            .await;

            return RateDecision {
                allowed: false,
                remaining,
                limit,
                retry_after_seconds: Some(retry_after),
                reason: Some("rate_limit_exceeded".to_string()),
            };
        }

        bucket.tokens -= 1.0;
        let remaining = bucket.tokens;
        drop(bucket);

        RateDecision {
            allowed: true,
            remaining,
            limit,
            retry_after_seconds: None,
            reason: None,
        }
    }

    /// Score the risk of running with the given scopes under this context.
    pub async fn assess_risk(
        &self,
        required_permissions: &[PermissionScope],
        ctx: &SecurityContext,
    ) -> RiskAssessment {
        let mut score = 0.0;
        let mut factors = Vec::new();

        if required_permissions.contains(&PermissionScope::Admin) {
            score += 0.3;
            factors.push("admin_access".to_string());
        }
        if required_permissions.contains(&PermissionScope::Delete) {
            score += 0.2;
            factors.push("delete_permission".to_string());
        }
        if required_permissions.contains(&PermissionScope::Execute) {
            score += 0.15;
            factors.push("execute_permission".to_string());
        }

        let identifier = Self::identifier(ctx);
        if let Some(threat) = self.threat_scores.get(&identifier) {
            if *threat > 0.0 {
                score += *threat * 0.3;
                factors.push("threat_history".to_string());
            }
        }

        if !ctx.is_authenticated {
            score += 0.2;
            factors.push("unauthenticated".to_string());
        } else if !ctx.mfa_verified {
            score += 0.1;
            factors.push("no_mfa".to_string());
        }

        let risk_level = if score >= 0.8 {
            RiskLevel::Critical
        } else if score >= 0.6 {
            RiskLevel::High
        } else if score >= 0.3 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        self.log_audit(
            ctx,
            "risk_assessment",
            &ctx.session_id,
            true,
            json!({
                "risk_level": risk_level,
                "risk_score": score,
                "factors": factors,
            }),
        )
        .await;

        RiskAssessment {
            risk_level,
            risk_score: score,
            factors,
            requires_approval: matches!(risk_level, RiskLevel::High | RiskLevel::Critical),
        }
    }

    /// Mint a session: 32-byte random id, config-driven TTL.
    pub async fn create_session(&self, ctx: &mut SecurityContext) -> SessionInfo {
        let mut id_bytes = [0u8; SESSION_ID_LEN];
        rand::thread_rng().fill_bytes(&mut id_bytes);
        let session_id = hex::encode(id_bytes);

        let timeout = self.config.session_timeout;
        let expires_at = Utc::now() + ChronoDuration::seconds(timeout as i64);

        ctx.session_id = session_id.clone();
        ctx.expires_at = Some(expires_at);

        self.sessions.insert(
            session_id.clone(),
            SessionEntry {
                user_id: ctx.user_id.clone(),
                expires_at,
            },
        );

        self.log_audit(
            ctx,
            "session_created",
            &session_id,
            true,
            json!({"expires_at": expires_at}),
        )
        .await;

        SessionInfo {
            session_id,
            expires_at,
            timeout_seconds: timeout,
        }
    }

    /// Reject absent or expired session ids; expired ones are evicted.
    pub async fn verify_session(&self, session_id: &str) -> SessionCheck {
        let Some(entry) = self.sessions.get(session_id) else {
            return SessionCheck {
                valid: false,
                reason: Some("session_not_found".to_string()),
                expires_at: None,
            };
        };

        if Utc::now() > entry.expires_at {
            drop(entry);
            self.sessions.remove(session_id);
            return SessionCheck {
                valid: false,
                reason: Some("session_expired".to_string()),
                expires_at: None,
            };
        }

        SessionCheck {
            valid: true,
            reason: None,
            expires_at: Some(entry.expires_at),
        }
    }

    pub fn session_user(&self, session_id: &str) -> Option<String> {
        self.sessions.get(session_id).map(|e| e.user_id.clone())
    }

    pub fn block_ip(&self, ip: &str) {
        self.blocked_ips
            .write()
            .expect("blocked ip lock")
            .insert(ip.to_string());
        tracing::warn!(ip, "blocked ip address");
    }

    pub fn unblock_ip(&self, ip: &str) {
        self.blocked_ips.write().expect("blocked ip lock").remove(ip);
        tracing::info!(ip, "unblocked ip address");
    }

    pub fn is_blocked(&self, ip: &str) -> bool {
        self.blocked_ips.read().expect("blocked ip lock").contains(ip)
    }

    pub fn threat_score(&self, identifier: &str) -> f64 {
        self.threat_scores
            .get(identifier)
            .map(|score| *score)
            .unwrap_or(0.0)
    }

    pub fn reset_threat_score(&self, identifier: &str) {
        self.threat_scores.remove(identifier);
    }

    /// Query the audit log with optional filters.
    pub fn audit_entries(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        self.audit_log
            .lock()
            .expect("audit lock")
            .iter()
            .filter(|entry| {
                query
                    .user_id
                    .as_ref()
                    .is_none_or(|user| &entry.user_id == user)
                    && query.action.as_ref().is_none_or(|a| &entry.action == a)
                    && query.since.is_none_or(|t| entry.timestamp >= t)
                    && query.until.is_none_or(|t| entry.timestamp <= t)
            })
            .cloned()
            .collect()
    }

    pub async fn log_audit(
        &self,
        ctx: &SecurityContext,
        action: &str,
        resource: &str,
        allowed: bool,
        details: Value,
    ) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            session_id: ctx.session_id.clone(),
            user_id: ctx.user_id.clone(),
            origin_ip: ctx.origin_ip.clone(),
            action: action.to_string(),
            resource: resource.to_string(),
            allowed,
            details,
            is_authenticated: ctx.is_authenticated,
            mfa_verified: ctx.mfa_verified,
        };

        self.audit_log.lock().expect("audit lock").push(entry.clone());

        let payload = serde_json::to_value(&entry).unwrap_or_else(|_| json!({}));
        let event = Event::new("security.audit", "security_service")
            .with_payload(payload)
            .with_priority(if allowed { 0 } else { 1 });
        if let Err(err) = self.bus.publish(event).await {
            tracing::warn!(error = %err, "failed to publish audit event");
        }

        tracing::info!(
            action,
            resource,
            allowed,
            user = %ctx.user_id,
            "audit"
        );
    }

    /// PBKDF2-HMAC-SHA256 password hash; returns (hash hex, salt hex).
    pub fn hash_password(password: &str, salt: Option<&str>) -> (String, String) {
        let salt = salt.map(str::to_string).unwrap_or_else(|| {
            let mut bytes = [0u8; SALT_LEN];
            rand::thread_rng().fill_bytes(&mut bytes);
            hex::encode(bytes)
        });

        let mut hash = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            password.as_bytes(),
            salt.as_bytes(),
            PASSWORD_ITERATIONS,
            &mut hash,
        );
        (hex::encode(hash), salt)
    }

    pub fn verify_password(password: &str, expected_hash: &str, salt: &str) -> bool {
        let (hash, _) = Self::hash_password(password, Some(salt));
        constant_time_eq(hash.as_bytes(), expected_hash.as_bytes())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BusConfig;
    use crate::graph::HandlerKind;

    fn service(max_per_hour: u32) -> SecurityService {
        let bus = Arc::new(EventBus::new(BusConfig::default()));
        SecurityService::new(
            bus,
            SecurityConfig {
                max_requests_per_hour: max_per_hour,
                threat_threshold: 0.8,
                session_timeout: 3600,
            },
        )
    }

    fn user_ctx() -> SecurityContext {
        SecurityContext::new("alice").authenticated()
    }

    #[tokio::test]
    async fn rate_limit_allows_then_denies() {
        let svc = service(5);
        let ctx = user_ctx();

        for i in 0..5 {
            let decision = svc.check_rate_limit(&ctx).await;
            assert!(decision.allowed, "request {i} should pass");
        }

        let denied = svc.check_rate_limit(&ctx).await;
        assert!(!denied.allowed);
        let retry_after = denied.retry_after_seconds.unwrap();
        assert!(
            (700.0..=725.0).contains(&retry_after),
            "retry_after {retry_after} outside expected window"
        );
        assert!(svc.threat_score("alice") > 0.0);
    }

    #[tokio::test]
    async fn bucket_never_exceeds_capacity() {
        let svc = service(10);
        let ctx = user_ctx();
        // Seed an overfull bucket; the refill step must clamp to capacity
        // before consuming.
        svc.buckets.insert(
            "alice".into(),
            TokenBucket {
                tokens: 25.0,
                last_refill: Instant::now(),
            },
        );
        let decision = svc.check_rate_limit(&ctx).await;
        assert!(decision.allowed);
        assert!(decision.remaining <= 9.0 + 1e-6);
    }

    #[tokio::test]
    async fn blocked_ip_precedes_token_consumption() {
        let svc = service(5);
        let ctx = SecurityContext::new("").with_origin_ip("10.0.0.9");
        svc.block_ip("10.0.0.9");

        let decision = svc.check_rate_limit(&ctx).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("ip_blocked"));
        // No bucket was touched.
        assert!(svc.buckets.get("10.0.0.9").is_none());

        svc.unblock_ip("10.0.0.9");
        assert!(svc.check_rate_limit(&ctx).await.allowed);
    }

    #[tokio::test]
    async fn risk_scoring_weights_and_levels() {
        let svc = service(100);

        let anon = SecurityContext::new("mallory");
        let assessment = svc
            .assess_risk(
                &[PermissionScope::Admin, PermissionScope::Delete],
                &anon,
            )
            .await;
        // 0.3 + 0.2 + 0.2 unauthenticated = 0.7 → HIGH
        assert!((assessment.risk_score - 0.7).abs() < 1e-9);
        assert_eq!(assessment.risk_level, RiskLevel::High);
        assert!(assessment.requires_approval);

        let trusted = user_ctx();
        let low = svc.assess_risk(&[PermissionScope::Read], &trusted).await;
        // authenticated without MFA adds 0.1 → LOW
        assert_eq!(low.risk_level, RiskLevel::Low);
        assert!(!low.requires_approval);
    }

    #[tokio::test]
    async fn permission_check_reports_missing_scopes_and_audits() {
        let svc = service(100);
        let ctx = user_ctx().with_scopes(vec![PermissionScope::Read]);
        let node = TaskNode::new("n1", HandlerKind::Shell)
            .with_permissions(vec![PermissionScope::Admin, PermissionScope::Read]);

        let check = svc.validate_permissions(&node, &ctx).await;
        assert!(!check.valid);
        assert_eq!(check.missing, vec![PermissionScope::Admin]);

        let denied = svc.audit_entries(&AuditQuery {
            action: Some("permission_check".to_string()),
            ..Default::default()
        });
        assert_eq!(denied.len(), 1);
        assert!(!denied[0].allowed);
    }

    #[tokio::test]
    async fn session_lifecycle_with_eager_eviction() {
        let svc = service(100);
        let mut ctx = user_ctx();
        let session = svc.create_session(&mut ctx).await;
        assert_eq!(session.session_id.len(), SESSION_ID_LEN * 2);
        assert!(svc.verify_session(&session.session_id).await.valid);

        assert!(!svc.verify_session("no-such-session").await.valid);

        // Force expiry and confirm the entry is evicted on verify.
        svc.sessions
            .get_mut(&session.session_id)
            .unwrap()
            .expires_at = Utc::now() - ChronoDuration::seconds(1);
        let expired = svc.verify_session(&session.session_id).await;
        assert!(!expired.valid);
        assert_eq!(expired.reason.as_deref(), Some("session_expired"));
        assert!(svc.sessions.get(&session.session_id).is_none());
    }

    #[test]
    fn password_hash_round_trip() {
        let (hash, salt) = SecurityService::hash_password("hunter2", None);
        assert!(SecurityService::verify_password("hunter2", &hash, &salt));
        assert!(!SecurityService::verify_password("hunter3", &hash, &salt));
        assert_eq!(salt.len(), SALT_LEN * 2);
    }
}
