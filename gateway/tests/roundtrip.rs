//! Compiler/matcher round trip: a Route compiled by the operator and
//! loaded into the gateway selects the same rules as a direct evaluation
//! of the Route spec.

use agentmesh_gateway::selector::{select_consistent_hash, select_weighted};
use agentmesh_gateway::{MatchRequest, RouteTable};
use agentmesh_operator::crds::{
    AgentRef, Route, RouteBackendStatus, RouteSpec,
};
use agentmesh_operator::reconcile::compile_route_table;
use std::collections::HashMap;

fn sample_route() -> Route {
    let spec: RouteSpec = serde_json::from_value(serde_json::json!({
        "rules": [
            {
                "name": "cost",
                "priority": 50,
                "match": {"intentRegex": "(?i)cost"},
                "backends": [
                    {"agentRef": {"name": "finops-a"}, "weight": 80},
                    {"agentRef": {"name": "finops-b"}, "weight": 20}
                ]
            },
            {
                "name": "alpha-direct",
                "priority": 10,
                "match": {"agent": "alpha"},
                "backends": [{"agentRef": {"name": "alpha"}}]
            },
            {
                "name": "acme-prod",
                "priority": 80,
                "match": {"tenantId": "acme", "headers": {"X-Env": "prod"}},
                "backends": [{"agentRef": {"name": "acme-dedicated"}}]
            }
        ]
    }))
    .unwrap();

    let mut route = Route::new("main", spec);
    route.metadata.namespace = Some("agents".to_string());
    route
}

fn ready_backends(names: &[&str]) -> Vec<RouteBackendStatus> {
    names
        .iter()
        .map(|name| RouteBackendStatus {
            agent_ref: AgentRef {
                name: (*name).to_string(),
                namespace: Some("agents".to_string()),
            },
            ready: true,
            endpoint: Some(format!("{name}.agents.svc.cluster.local:8080")),
        })
        .collect()
}

fn gateway_table(route: &Route) -> RouteTable {
    let backends = ready_backends(&["finops-a", "finops-b", "alpha", "acme-dedicated"]);
    let compiled = compile_route_table(route, "agents", &backends).unwrap();
    let table = RouteTable::new();
    table
        .load_from_json(&serde_json::to_vec(&compiled).unwrap())
        .unwrap();
    table
}

/// Reference evaluation straight off the Route spec: priority-descending,
/// first rule whose criteria all hold.
fn evaluate_directly(route: &Route, request: &MatchRequest) -> Option<String> {
    let mut rules: Vec<_> = route.spec.rules.iter().collect();
    rules.sort_by(|a, b| b.priority.unwrap_or(0).cmp(&a.priority.unwrap_or(0)));

    if !request.agent.is_empty() {
        if let Some(rule) = rules
            .iter()
            .find(|r| r.match_.agent.as_deref() == Some(request.agent.as_str()))
        {
            return Some(rule.name.clone());
        }
    }

    for rule in rules {
        let m = &rule.match_;
        if let Some(agent) = m.agent.as_deref() {
            if agent != request.agent {
                continue;
            }
        }
        if let Some(pattern) = m.intent_regex.as_deref() {
            if !regex::Regex::new(pattern).unwrap().is_match(&request.intent) {
                continue;
            }
        }
        if let Some(tenant) = m.tenant_id.as_deref() {
            if tenant != request.tenant_id {
                continue;
            }
        }
        if !m
            .headers
            .iter()
            .all(|(k, v)| request.headers.get(k) == Some(v))
        {
            continue;
        }
        return Some(rule.name.clone());
    }

    None
}

#[test]
fn test_compiled_table_matches_direct_evaluation() {
    let route = sample_route();
    let table = gateway_table(&route);

    let probes = vec![
        MatchRequest {
            agent: "alpha".to_string(),
            ..Default::default()
        },
        MatchRequest {
            intent: "Cost report for June".to_string(),
            ..Default::default()
        },
        MatchRequest {
            intent: "COST breakdown".to_string(),
            tenant_id: "acme".to_string(),
            headers: HashMap::from([("X-Env".to_string(), "prod".to_string())]),
            ..Default::default()
        },
        MatchRequest {
            intent: "docs please".to_string(),
            ..Default::default()
        },
        MatchRequest {
            tenant_id: "acme".to_string(),
            headers: HashMap::from([("X-Env".to_string(), "staging".to_string())]),
            ..Default::default()
        },
    ];

    for probe in probes {
        let via_table = table.match_request(&probe).map(|m| m.rule_name);
        let direct = evaluate_directly(&route, &probe);
        assert_eq!(via_table, direct, "diverged for {probe:?}");
    }
}

#[test]
fn test_matching_is_idempotent() {
    let route = sample_route();
    let table = gateway_table(&route);

    let request = MatchRequest {
        intent: "cost of storage".to_string(),
        tenant_id: "acme".to_string(),
        headers: HashMap::new(),
        ..Default::default()
    };

    let first = table.match_request(&request).unwrap();
    for _ in 0..100 {
        let again = table.match_request(&request).unwrap();
        assert_eq!(first.rule_name, again.rule_name);
    }
}

#[test]
fn test_weighted_split_approximates_declared_weights() {
    let route = sample_route();
    let table = gateway_table(&route);

    let result = table
        .match_request(&MatchRequest {
            intent: "Cost report".to_string(),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(result.rule_name, "cost");
    assert_eq!(result.backends.len(), 2);

    let mut hits_a = 0;
    for _ in 0..10_000 {
        if select_weighted(&result.backends).unwrap().agent_name == "finops-a" {
            hits_a += 1;
        }
    }
    assert!((7600..=8400).contains(&hits_a), "hits_a = {hits_a}");
}

#[test]
fn test_consistent_hash_is_stable_while_backend_set_is() {
    let route = sample_route();
    let table = gateway_table(&route);

    let result = table
        .match_request(&MatchRequest {
            intent: "cost".to_string(),
            ..Default::default()
        })
        .unwrap();

    let chosen = select_consistent_hash(&result.backends, "acme:session-9")
        .unwrap()
        .agent_name
        .clone();
    for _ in 0..50 {
        assert_eq!(
            select_consistent_hash(&result.backends, "acme:session-9")
                .unwrap()
                .agent_name,
            chosen
        );
    }
}

#[test]
fn test_priority_orders_cross_rule_overlap() {
    // acme-prod (priority 80) outranks cost (priority 50) when both match
    let route = sample_route();
    let table = gateway_table(&route);

    let result = table
        .match_request(&MatchRequest {
            intent: "cost overview".to_string(),
            tenant_id: "acme".to_string(),
            headers: HashMap::from([("X-Env".to_string(), "prod".to_string())]),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(result.rule_name, "acme-prod");
}
