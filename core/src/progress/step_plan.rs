//! Deterministic, total step-list generation: `(analysts, research_depth,
//! market_type) -> StepPlan`. No I/O, no globals; table-driven per-step
//! weights, renormalized so the generated plan always sums to 1.0.

use std::collections::HashMap;

use crate::domain::{MarketType, Step, StepStatus};

/// Fixed (name, rough_weight) pairs for the preparation phase.
const PREP_STEPS: &[(&str, f64)] = &[
    ("analysis_start", 0.01),
    ("cost_estimation", 0.01),
    ("data_preparation", 0.01),
    ("environment_validation", 0.01),
    ("config_builder", 0.01),
    ("symbol_formatting", 0.01),
    ("graph_initialization", 0.01),
    ("step_output_directory", 0.01),
];

const DEBATE_STEPS: &[&str] = &["bull_researcher", "bear_researcher", "research_manager"];
const DEBATE_PHASE_WEIGHT: f64 = 0.15;

const TRADER_WEIGHT: f64 = 0.05;

const RISK_STEPS: &[&str] = &["risky_analyst", "safe_analyst", "neutral_analyst", "risk_manager"];
const RISK_PHASE_WEIGHT: f64 = 0.15;
const RISK_PROMPT_WEIGHT: f64 = 0.05;

const SIGNAL_PROCESSING_WEIGHT: f64 = 0.05;

const POST_STEPS: &[&str] = &["result_processing", "completion_logging", "save_results"];
const POST_PHASE_WEIGHT: f64 = 0.07;

const ANALYST_PHASE_WEIGHT: f64 = 0.50;

/// `[supplemented]` per-analyst-kind name/description, reused in meaning
/// (not text) from the original's analyst metadata table.
fn analyst_step_info(analyst: &str) -> (String, String) {
    match analyst {
        "market" => ("Market Analyst".into(), "Analyzes price action and technical indicators".into()),
        "fundamentals" => ("Fundamentals Analyst".into(), "Analyzes financial statements and valuation".into()),
        "technical" => ("Technical Analyst".into(), "Analyzes chart patterns and trading signals".into()),
        "sentiment" => ("Sentiment Analyst".into(), "Analyzes market sentiment indicators".into()),
        "news" => ("News Analyst".into(), "Analyzes recent news coverage".into()),
        "social" | "social_media" => ("Social Media Analyst".into(), "Analyzes social media discussion".into()),
        "risk" => ("Risk Analyst".into(), "Analyzes risk exposure".into()),
        other => (format!("{other} analyst"), format!("performs {other}-related analysis")),
    }
}

/// Provider duration multiplier defaults (`[supplemented]`); unknown
/// providers default to 1.0.
pub fn provider_multiplier(provider: &str) -> f64 {
    match provider {
        "dashscope" => 1.0,
        "deepseek" => 0.7,
        "google" => 1.3,
        _ => 1.0,
    }
}

/// Research-depth duration multiplier defaults (`[supplemented]`).
pub fn depth_multiplier(research_depth: u8) -> f64 {
    match research_depth {
        1 => 0.8,
        2 => 1.0,
        3 => 1.3,
        _ => 1.0,
    }
}

/// Per-analyst base seconds by depth (`[supplemented]`); depth outside the
/// table defaults to 180s.
fn per_analyst_base_seconds(research_depth: u8) -> f64 {
    match research_depth {
        1 => 120.0,
        2 => 180.0,
        3 => 240.0,
        _ => 180.0,
    }
}

/// `base_seconds(60) + per_analyst(depth) * len(analysts)`, scaled by the
/// provider and depth multipliers.
pub fn duration_estimate_seconds(analysts: &[String], research_depth: u8, provider: &str) -> f64 {
    let base = 60.0 + per_analyst_base_seconds(research_depth) * analysts.len() as f64;
    base * provider_multiplier(provider) * depth_multiplier(research_depth)
}

/// The generated plan: the ordered step list plus a `module_name ->
/// step_index` lookup built once here (resolves the cache-reuse step
/// correlation design note: table-driven, not keyword matching).
#[derive(Debug, Clone)]
pub struct StepPlan {
    pub steps: Vec<Step>,
    pub module_index: HashMap<String, usize>,
}

impl StepPlan {
    pub fn total_weight(&self) -> f64 {
        self.steps.iter().map(|s| s.weight).sum()
    }

    pub fn step_index_for_module(&self, module_name: &str) -> Option<usize> {
        self.module_index.get(module_name).copied()
    }
}

struct RawStep {
    name: String,
    description: String,
    rough_weight: f64,
    phase: &'static str,
    module_name: Option<String>,
    round: Option<u32>,
    role: Option<String>,
}

/// Pure step-list generation. Deterministic and total: same inputs always
/// produce the same plan.
pub fn plan(analysts: &[String], research_depth: u8, _market_type: MarketType) -> StepPlan {
    let mut raw = Vec::new();

    for (name, weight) in PREP_STEPS {
        raw.push(RawStep {
            name: (*name).to_string(),
            description: format!("{} phase", name.replace('_', " ")),
            rough_weight: *weight,
            phase: "preparation",
            module_name: None,
            round: None,
            role: None,
        });
    }

    let analyst_weight = if analysts.is_empty() {
        0.0
    } else {
        ANALYST_PHASE_WEIGHT / analysts.len() as f64
    };
    for analyst in analysts {
        let (name, description) = analyst_step_info(analyst);
        let module_name = format!("{analyst}_analyst");
        raw.push(RawStep {
            name,
            description,
            rough_weight: analyst_weight,
            phase: "analysis",
            module_name: Some(module_name),
            round: None,
            role: Some(analyst.clone()),
        });
    }

    if research_depth >= 2 {
        let per_step = DEBATE_PHASE_WEIGHT / DEBATE_STEPS.len() as f64;
        for name in DEBATE_STEPS {
            raw.push(RawStep {
                name: (*name).to_string(),
                description: format!("{} debate stage", name.replace('_', " ")),
                rough_weight: per_step,
                phase: "debate",
                module_name: Some((*name).to_string()),
                round: Some(1),
                role: None,
            });
        }
    }

    raw.push(RawStep {
        name: "trader".to_string(),
        description: "Synthesizes a trading decision".to_string(),
        rough_weight: TRADER_WEIGHT,
        phase: "trading",
        module_name: Some("trader".to_string()),
        round: None,
        role: None,
    });

    if research_depth >= 3 {
        let per_step = RISK_PHASE_WEIGHT / RISK_STEPS.len() as f64;
        for name in RISK_STEPS {
            raw.push(RawStep {
                name: (*name).to_string(),
                description: format!("{} risk assessment", name.replace('_', " ")),
                rough_weight: per_step,
                phase: "risk",
                module_name: Some((*name).to_string()),
                round: Some(1),
                role: None,
            });
        }
    } else {
        raw.push(RawStep {
            name: "risk_prompt".to_string(),
            description: "Single-pass risk prompt".to_string(),
            rough_weight: RISK_PROMPT_WEIGHT,
            phase: "risk",
            module_name: Some("risk_prompt".to_string()),
            round: None,
            role: None,
        });
    }

    raw.push(RawStep {
        name: "graph_signal_processing".to_string(),
        description: "Processes the final trading signal".to_string(),
        rough_weight: SIGNAL_PROCESSING_WEIGHT,
        phase: "signal",
        module_name: Some("graph_signal_processing".to_string()),
        round: None,
        role: None,
    });

    let per_post = POST_PHASE_WEIGHT / POST_STEPS.len() as f64;
    for name in POST_STEPS {
        raw.push(RawStep {
            name: (*name).to_string(),
            description: format!("{} post-processing", name.replace('_', " ")),
            rough_weight: per_post,
            phase: "post_processing",
            module_name: None,
            round: None,
            role: None,
        });
    }

    let total_rough: f64 = raw.iter().map(|s| s.rough_weight).sum();
    let mut steps = Vec::with_capacity(raw.len());
    let mut module_index = HashMap::new();

    for (index, r) in raw.into_iter().enumerate() {
        if let Some(module_name) = &r.module_name {
            module_index.insert(module_name.clone(), index);
        }
        steps.push(Step {
            step_index: index,
            name: r.name,
            description: r.description,
            weight: if total_rough > 0.0 { r.rough_weight / total_rough } else { 0.0 },
            phase: r.phase.to_string(),
            status: StepStatus::Pending,
            round: r.round,
            role: r.role,
            module_name: r.module_name,
        });
    }

    StepPlan { steps, module_index }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysts(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn weights_always_renormalize_to_one() {
        for depth in 1..=5u8 {
            let p = plan(&analysts(&["market", "news"]), depth, MarketType::UsStock);
            assert!((p.total_weight() - 1.0).abs() < 1e-6, "depth={depth} sum={}", p.total_weight());
        }
    }

    #[test]
    fn depth_one_has_risk_prompt_not_four_way_risk() {
        let p = plan(&analysts(&["market"]), 1, MarketType::UsStock);
        assert!(p.steps.iter().any(|s| s.name == "risk_prompt"));
        assert!(!p.steps.iter().any(|s| s.name == "risk_manager"));
        assert!(!p.steps.iter().any(|s| s.phase == "debate"));
        assert_eq!(p.steps.len(), PREP_STEPS.len() + 1 + 1 + 1 + 1 + POST_STEPS.len());
    }

    #[test]
    fn depth_three_has_full_risk_phase_and_debate() {
        let p = plan(&analysts(&["market"]), 3, MarketType::UsStock);
        assert!(p.steps.iter().any(|s| s.name == "risk_manager"));
        assert!(p.steps.iter().any(|s| s.phase == "debate"));
        assert!(!p.steps.iter().any(|s| s.name == "risk_prompt"));
    }

    #[test]
    fn module_index_resolves_analyst_steps() {
        let p = plan(&analysts(&["market", "news"]), 1, MarketType::UsStock);
        let idx = p.step_index_for_module("market_analyst").unwrap();
        assert_eq!(p.steps[idx].module_name.as_deref(), Some("market_analyst"));
    }

    #[test]
    fn duration_estimate_scales_with_provider_and_depth() {
        let a = analysts(&["market", "news"]);
        let d1 = duration_estimate_seconds(&a, 1, "deepseek");
        let d3 = duration_estimate_seconds(&a, 3, "google");
        assert!(d3 > d1);
    }
}
