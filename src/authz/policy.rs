//! Resource-scoped policy evaluation.
//!
//! Policies attach condition sets to resource ids and are consulted
//! only when a permission check names a resource. Conditions are
//! data-driven: a kind string plus a parameter object. Unrecognized
//! kinds deny: a policy referencing a condition this build cannot
//! evaluate must never silently pass.

use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::User;

/// A single policy condition: evaluator kind plus parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyCondition {
    /// Evaluator name: `attribute_equals`, `time_window`, `ip_allow`.
    pub kind: String,
    /// Evaluator-specific parameters.
    pub params: serde_json::Value,
}

/// Condition set guarding a resource. All conditions must hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePolicy {
    /// Resource id the policy guards.
    pub resource: String,
    /// Conditions, all of which must evaluate true.
    pub conditions: Vec<PolicyCondition>,
}

/// Caller-side facts a policy may reference.
#[derive(Debug, Clone, Default)]
pub struct AccessContext {
    /// Source address of the caller, if known.
    pub source_ip: Option<IpAddr>,
    /// Evaluation instant override; defaults to now. Lets tests pin
    /// time-window conditions.
    pub at: Option<DateTime<Utc>>,
}

/// Evaluate a policy against a user and access context.
pub fn evaluate(policy: &ResourcePolicy, user: &User, ctx: &AccessContext) -> bool {
    policy
        .conditions
        .iter()
        .all(|condition| evaluate_condition(condition, user, ctx))
}

fn evaluate_condition(condition: &PolicyCondition, user: &User, ctx: &AccessContext) -> bool {
    match condition.kind.as_str() {
        "attribute_equals" => attribute_equals(&condition.params, user),
        "time_window" => time_window(&condition.params, ctx),
        "ip_allow" => ip_allow(&condition.params, ctx),
        other => {
            warn!(kind = other, "unknown policy condition kind, denying");
            false
        }
    }
}

fn attribute_equals(params: &serde_json::Value, user: &User) -> bool {
    let Some(attribute) = params.get("attribute").and_then(|v| v.as_str()) else {
        return false;
    };
    let Some(expected) = params.get("value") else {
        return false;
    };
    user.attributes.get(attribute).is_some_and(|v| v == expected)
}

/// Daily UTC hour window `[start_hour, end_hour)`. Windows may wrap
/// midnight (`start_hour > end_hour`).
fn time_window(params: &serde_json::Value, ctx: &AccessContext) -> bool {
    let Some(start) = params.get("start_hour").and_then(|v| v.as_u64()) else {
        return false;
    };
    let Some(end) = params.get("end_hour").and_then(|v| v.as_u64()) else {
        return false;
    };
    if start > 23 || end > 24 {
        return false;
    }
    let hour = u64::from(ctx.at.unwrap_or_else(Utc::now).hour());
    if start <= end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

fn ip_allow(params: &serde_json::Value, ctx: &AccessContext) -> bool {
    let Some(ranges) = params.get("ranges").and_then(|v| v.as_array()) else {
        return false;
    };
    let Some(source) = ctx.source_ip else {
        return false;
    };
    ranges
        .iter()
        .filter_map(|r| r.as_str())
        .any(|range| range_matches(range, source))
}

/// Match an address against `a.b.c.d/len` (IPv4) or an exact address.
fn range_matches(range: &str, source: IpAddr) -> bool {
    match range.split_once('/') {
        Some((base, len)) => {
            let (IpAddr::V4(source), Ok(base)) = (source, base.parse::<Ipv4Addr>()) else {
                return false;
            };
            let Ok(len) = len.parse::<u32>() else {
                return false;
            };
            if len > 32 {
                return false;
            }
            let mask = u32::MAX
                .checked_shl(32_u32.saturating_sub(len))
                .unwrap_or(0);
            (u32::from(source) & mask) == (u32::from(base) & mask)
        }
        None => range.parse::<IpAddr>().is_ok_and(|addr| addr == source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn test_user(attributes: HashMap<String, serde_json::Value>) -> User {
        User {
            id: "u1".to_owned(),
            username: "case".to_owned(),
            email: "case@straylight.test".to_owned(),
            roles: HashSet::new(),
            direct_permissions: HashSet::new(),
            attributes,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn condition(kind: &str, params: serde_json::Value) -> PolicyCondition {
        PolicyCondition {
            kind: kind.to_owned(),
            params,
        }
    }

    fn policy(conditions: Vec<PolicyCondition>) -> ResourcePolicy {
        ResourcePolicy {
            resource: "vault/keys".to_owned(),
            conditions,
        }
    }

    #[test]
    fn attribute_equality() {
        let mut attrs = HashMap::new();
        attrs.insert("department".to_owned(), serde_json::json!("ops"));
        let user = test_user(attrs);
        let ctx = AccessContext::default();

        let allow = policy(vec![condition(
            "attribute_equals",
            serde_json::json!({"attribute": "department", "value": "ops"}),
        )]);
        assert!(evaluate(&allow, &user, &ctx));

        let deny = policy(vec![condition(
            "attribute_equals",
            serde_json::json!({"attribute": "department", "value": "sales"}),
        )]);
        assert!(!evaluate(&deny, &user, &ctx));
    }

    #[test]
    fn time_window_plain_and_wrapping() {
        let user = test_user(HashMap::new());
        let at = |hour: u32| AccessContext {
            source_ip: None,
            at: Some(
                Utc::now()
                    .date_naive()
                    .and_hms_opt(hour, 30, 0)
                    .expect("valid time")
                    .and_utc(),
            ),
        };

        let business = policy(vec![condition(
            "time_window",
            serde_json::json!({"start_hour": 9, "end_hour": 17}),
        )]);
        assert!(evaluate(&business, &user, &at(10)));
        assert!(!evaluate(&business, &user, &at(20)));

        let night = policy(vec![condition(
            "time_window",
            serde_json::json!({"start_hour": 22, "end_hour": 6}),
        )]);
        assert!(evaluate(&night, &user, &at(23)));
        assert!(evaluate(&night, &user, &at(3)));
        assert!(!evaluate(&night, &user, &at(12)));
    }

    #[test]
    fn ip_allow_list() {
        let user = test_user(HashMap::new());
        let from = |ip: &str| AccessContext {
            source_ip: Some(ip.parse().expect("valid ip")),
            at: None,
        };

        let internal = policy(vec![condition(
            "ip_allow",
            serde_json::json!({"ranges": ["10.0.0.0/8", "192.168.1.5"]}),
        )]);
        assert!(evaluate(&internal, &user, &from("10.200.3.4")));
        assert!(evaluate(&internal, &user, &from("192.168.1.5")));
        assert!(!evaluate(&internal, &user, &from("192.168.1.6")));
        assert!(!evaluate(&internal, &user, &from("8.8.8.8")));

        // No source address cannot satisfy an allow-list.
        assert!(!evaluate(&internal, &user, &AccessContext::default()));
    }

    #[test]
    fn unknown_kind_denies() {
        let user = test_user(HashMap::new());
        let ctx = AccessContext::default();
        let p = policy(vec![condition("geo_fence", serde_json::json!({}))]);
        assert!(!evaluate(&p, &user, &ctx));
    }

    #[test]
    fn all_conditions_must_hold() {
        let mut attrs = HashMap::new();
        attrs.insert("department".to_owned(), serde_json::json!("ops"));
        let user = test_user(attrs);
        let ctx = AccessContext {
            source_ip: Some("10.1.1.1".parse().expect("ip")),
            at: None,
        };

        let p = policy(vec![
            condition(
                "attribute_equals",
                serde_json::json!({"attribute": "department", "value": "ops"}),
            ),
            condition("ip_allow", serde_json::json!({"ranges": ["172.16.0.0/12"]})),
        ]);
        assert!(!evaluate(&p, &user, &ctx));
    }

    #[test]
    fn malformed_params_deny() {
        let user = test_user(HashMap::new());
        let ctx = AccessContext::default();
        let p = policy(vec![condition("time_window", serde_json::json!({}))]);
        assert!(!evaluate(&p, &user, &ctx));
    }
}
