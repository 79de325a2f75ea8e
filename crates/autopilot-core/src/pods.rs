//! Capability pods, build-and-ship kernels, and the industry tables that map
//! a brief onto them.
//!
//! Every table here is static and ordered; selection functions walk them in
//! declaration order so the same brief always yields the same pods/kernels.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

// ---------------------------------------------------------------------------
// PodSpec / KernelSpec
// ---------------------------------------------------------------------------

/// A bundle of agent roles covering one project area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PodSpec {
    pub pod_id: &'static str,
    pub name: &'static str,
    pub agents: &'static [&'static str],
    pub always_on: bool,
    pub description: &'static str,
}

/// A domain-specific build-and-ship workflow family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KernelSpec {
    pub kernel_id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub tags: &'static [&'static str],
}

// ---------------------------------------------------------------------------
// Pods
// ---------------------------------------------------------------------------

pub const CORE_POD: PodSpec = PodSpec {
    pod_id: "core",
    name: "Core",
    agents: &[
        "orchestrator",
        "scribe",
        "research",
        "quality",
        "delivery_tracker",
    ],
    always_on: true,
    description: "Orchestration, documentation, research, quality, and delivery tracking.",
};

pub const DISCOVERY_POD: PodSpec = PodSpec {
    pod_id: "discovery",
    name: "Discovery & Definition",
    agents: &[
        "requirements_specifier",
        "competitor_analyst",
        "user_researcher",
        "feasibility_assessor",
    ],
    always_on: false,
    description: "Requirements clarification, competitor analysis, user research, feasibility.",
};

pub const ATTACHABLE_PODS: &[PodSpec] = &[
    DISCOVERY_POD,
    PodSpec {
        pod_id: "commercial",
        name: "Commercial",
        agents: &["pricing_analyst", "gtm_strategist", "sales_enabler"],
        always_on: false,
        description: "Pricing, go-to-market, sales enablement, revenue modeling.",
    },
    PodSpec {
        pod_id: "finance_governance",
        name: "Finance & Governance",
        agents: &["budget_planner", "cost_controller", "audit_steward"],
        always_on: false,
        description: "Budgeting, cost control, audit compliance, financial reporting.",
    },
    PodSpec {
        pod_id: "legal_risk",
        name: "Legal / Risk / Compliance",
        agents: &["contract_reviewer", "compliance_officer", "risk_assessor"],
        always_on: false,
        description: "Contract review, regulatory compliance, risk assessment.",
    },
    PodSpec {
        pod_id: "people_talent",
        name: "People & Talent",
        agents: &["team_planner", "hiring_advisor", "skill_gap_analyst"],
        always_on: false,
        description: "Team composition, hiring plans, onboarding, skill gaps.",
    },
    PodSpec {
        pod_id: "ops_supply",
        name: "Ops & Supply",
        agents: &["procurement_agent", "vendor_manager", "logistics_planner"],
        always_on: false,
        description: "Procurement, vendor management, supply chain, logistics.",
    },
    PodSpec {
        pod_id: "data_insight",
        name: "Data & Insight",
        agents: &["data_architect", "bi_analyst", "metrics_designer"],
        always_on: false,
        description: "Data pipelines, BI reporting, metrics systems, analytics.",
    },
];

/// Substring signals that attach a pod. Order matches `ATTACHABLE_PODS`.
pub const POD_SIGNAL_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "discovery",
        &[
            "requirements",
            "research",
            "competitor",
            "feasibility",
            "discovery",
            "user research",
            "market",
        ],
    ),
    (
        "commercial",
        &[
            "pricing",
            "go-to-market",
            "revenue",
            "sales",
            "commercial",
            "monetiz",
        ],
    ),
    (
        "finance_governance",
        &[
            "budget",
            "cost",
            "audit",
            "financial report",
            "governance",
            "sox",
        ],
    ),
    (
        "legal_risk",
        &[
            "compliance",
            "regulatory",
            "legal",
            "contract",
            "risk",
            "gdpr",
            "hipaa",
        ],
    ),
    (
        "people_talent",
        &["hiring", "onboard", "team", "talent", "staffing", "skill gap"],
    ),
    (
        "ops_supply",
        &[
            "procurement",
            "vendor",
            "supply chain",
            "logistics",
            "sourcing",
        ],
    ),
    (
        "data_insight",
        &[
            "data pipeline",
            "analytics",
            "bi ",
            "dashboard",
            "metrics",
            "reporting",
        ],
    ),
];

pub fn attachable_pod(pod_id: &str) -> Option<&'static PodSpec> {
    ATTACHABLE_PODS.iter().find(|p| p.pod_id == pod_id)
}

// ---------------------------------------------------------------------------
// Kernels
// ---------------------------------------------------------------------------

pub const KERNELS: &[KernelSpec] = &[
    KernelSpec {
        kernel_id: "digital_product",
        name: "B-Digital Product",
        description: "Apps, SaaS, platforms with iterative software delivery.",
        tags: &["software", "product", "build", "ship"],
    },
    KernelSpec {
        kernel_id: "data_analytics",
        name: "B-Data & Analytics",
        description: "Pipelines, BI, metrics systems, and data platforms.",
        tags: &["data", "analytics", "pipeline", "bi"],
    },
    KernelSpec {
        kernel_id: "ml_ai_systems",
        name: "B-ML/AI Systems",
        description: "Model lifecycle, evaluation, monitoring, and ML ops.",
        tags: &["ml", "ai", "model", "evaluation"],
    },
    KernelSpec {
        kernel_id: "cyber_secops",
        name: "B-Cyber & SecOps",
        description: "Detections, incident response, hardening, security operations.",
        tags: &["security", "cyber", "incident", "detection"],
    },
    KernelSpec {
        kernel_id: "embedded_mechatronics",
        name: "B-Embedded & Mechatronics",
        description: "Firmware, sensors, controls, and embedded systems.",
        tags: &["embedded", "firmware", "sensors", "controls"],
    },
    KernelSpec {
        kernel_id: "safety_critical",
        name: "B-Safety-Critical Engineering",
        description: "Formal V&V, safety cases, and safety-critical systems.",
        tags: &["safety", "critical", "verification", "validation"],
    },
    KernelSpec {
        kernel_id: "industrial_manufacturing",
        name: "B-Industrial Manufacturing",
        description: "Process engineering, industrialization, and manufacturing.",
        tags: &["manufacturing", "process", "industrialization"],
    },
    KernelSpec {
        kernel_id: "chem_materials",
        name: "B-Chem/Materials Process",
        description: "Formulations, scale-up, QA evidence for chemical and materials work.",
        tags: &["chemistry", "materials", "formulation", "scale-up"],
    },
    KernelSpec {
        kernel_id: "life_sciences",
        name: "B-Life Sciences R&D to Regulated",
        description: "Evidence chains, GLxP-style discipline, regulated R&D.",
        tags: &["life_sciences", "pharma", "biotech", "regulated"],
    },
    KernelSpec {
        kernel_id: "energy_asset_ops",
        name: "B-Energy & Asset Ops",
        description: "Asset operations, reliability, and field work.",
        tags: &["energy", "asset", "reliability", "field"],
    },
    KernelSpec {
        kernel_id: "financial_products",
        name: "B-Financial Products & Controls",
        description: "Auditability, risk, models, reporting for financial products.",
        tags: &["finance", "risk", "audit", "reporting"],
    },
    KernelSpec {
        kernel_id: "construction_infra",
        name: "B-Construction & Infrastructure",
        description: "Permits, schedule/cost, site safety, and infrastructure.",
        tags: &["construction", "infrastructure", "permits", "civil"],
    },
    KernelSpec {
        kernel_id: "content_production",
        name: "B-Content Production",
        description: "Media, publishing, brand assets, and content workflows.",
        tags: &["content", "media", "publishing", "brand"],
    },
    KernelSpec {
        kernel_id: "professional_services",
        name: "B-Professional Services Delivery",
        description: "SoW, client governance, delivery ops, and service engagements.",
        tags: &["services", "consulting", "client", "delivery"],
    },
];

pub const FALLBACK_KERNEL: &str = "digital_product";

pub fn kernel(kernel_id: &str) -> Option<&'static KernelSpec> {
    KERNELS.iter().find(|k| k.kernel_id == kernel_id)
}

// ---------------------------------------------------------------------------
// Industry tables
// ---------------------------------------------------------------------------

/// Industry name → default kernels, in preference order.
pub const INDUSTRY_KERNELS: &[(&str, &[&str])] = &[
    ("Software / SaaS", &["digital_product"]),
    ("IT Services / Systems Integration", &["professional_services"]),
    ("Cloud / Data Centers", &["energy_asset_ops", "digital_product"]),
    ("Cybersecurity (vendors)", &["digital_product", "cyber_secops"]),
    ("Telecommunications", &["energy_asset_ops", "digital_product"]),
    ("Semiconductors", &["industrial_manufacturing", "safety_critical"]),
    ("Consumer Electronics", &["embedded_mechatronics", "industrial_manufacturing"]),
    ("Automotive (OEM & mobility)", &["embedded_mechatronics", "safety_critical"]),
    ("Rail / Transit", &["safety_critical", "construction_infra"]),
    ("Aerospace", &["safety_critical", "embedded_mechatronics"]),
    ("Space (launch/satellites)", &["safety_critical", "embedded_mechatronics"]),
    ("Defense", &["safety_critical", "cyber_secops"]),
    ("Maritime / Shipping", &["energy_asset_ops", "construction_infra"]),
    ("Logistics / 3PL", &["construction_infra", "data_analytics"]),
    ("Retail (physical)", &["data_analytics", "digital_product"]),
    ("E-commerce / Marketplaces", &["digital_product", "data_analytics"]),
    ("Consumer Packaged Goods (CPG)", &["industrial_manufacturing", "data_analytics"]),
    ("Food & Beverage Manufacturing", &["industrial_manufacturing", "chem_materials"]),
    ("Agriculture", &["industrial_manufacturing", "data_analytics"]),
    ("Mining & Metals", &["energy_asset_ops", "industrial_manufacturing"]),
    ("Oil & Gas (upstream)", &["energy_asset_ops"]),
    ("Oil & Gas (midstream)", &["energy_asset_ops"]),
    ("Refining / Petrochemicals", &["chem_materials", "industrial_manufacturing"]),
    ("Chemicals (specialty/commodity)", &["chem_materials"]),
    ("Materials (advanced materials)", &["chem_materials"]),
    ("Construction (GC / EPC)", &["construction_infra"]),
    ("Real Estate (dev/property mgmt)", &["construction_infra", "energy_asset_ops"]),
    ("Utilities (electric/gas/water)", &["energy_asset_ops"]),
    ("Power generation (incl. nuclear)", &["energy_asset_ops", "safety_critical"]),
    ("Renewables (wind/solar/storage)", &["energy_asset_ops", "embedded_mechatronics"]),
    ("Healthcare Providers (hospitals/clinics)", &["life_sciences", "data_analytics"]),
    ("Health Insurance / Payers", &["financial_products", "data_analytics"]),
    ("Medical Devices", &["safety_critical", "life_sciences"]),
    ("Pharmaceuticals", &["life_sciences"]),
    ("Biotech", &["life_sciences"]),
    ("CRO / Clinical Trials Services", &["life_sciences", "professional_services"]),
    ("Banking (retail/commercial)", &["financial_products"]),
    ("Payments / Fintech", &["financial_products", "digital_product"]),
    ("Insurance", &["financial_products", "data_analytics"]),
    ("Capital Markets / Asset Mgmt", &["financial_products", "ml_ai_systems"]),
];

/// Industry name → pods attached regardless of keyword signals.
pub const INDUSTRY_PODS: &[(&str, &[&str])] = &[
    ("Pharmaceuticals", &["legal_risk", "finance_governance"]),
    ("Biotech", &["legal_risk"]),
    ("Medical Devices", &["legal_risk"]),
    ("CRO / Clinical Trials Services", &["legal_risk", "ops_supply"]),
    ("Healthcare Providers (hospitals/clinics)", &["legal_risk", "data_insight"]),
    ("Health Insurance / Payers", &["legal_risk", "finance_governance"]),
    ("Banking (retail/commercial)", &["legal_risk", "finance_governance"]),
    ("Payments / Fintech", &["legal_risk", "finance_governance"]),
    ("Insurance", &["legal_risk", "finance_governance"]),
    ("Capital Markets / Asset Mgmt", &["legal_risk", "finance_governance"]),
    ("E-commerce / Marketplaces", &["commercial", "data_insight"]),
    ("Retail (physical)", &["commercial", "ops_supply"]),
    ("Defense", &["legal_risk", "ops_supply"]),
    ("Logistics / 3PL", &["ops_supply", "data_insight"]),
    ("Construction (GC / EPC)", &["ops_supply", "finance_governance"]),
];

/// First table entry whose industry name contains `industry` (case-insensitive).
fn industry_entry<'a>(
    table: &'a [(&'static str, &'static [&'static str])],
    industry: &str,
) -> Option<&'a [&'static str]> {
    let needle = industry.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    table
        .iter()
        .find(|(name, _)| name.to_lowercase().contains(&needle))
        .map(|(_, ids)| *ids)
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Pick pods for a brief. Core and discovery are always attached; hints,
/// industry defaults, and keyword signals add the rest.
pub fn select_pods(
    intent_text: &str,
    industry: &str,
    pod_hints: &BTreeSet<String>,
) -> BTreeMap<&'static str, &'static PodSpec> {
    let mut selected: BTreeMap<&'static str, &'static PodSpec> = BTreeMap::new();
    selected.insert(CORE_POD.pod_id, &CORE_POD);
    selected.insert(DISCOVERY_POD.pod_id, &DISCOVERY_POD);

    for hint in pod_hints {
        let normalized = hint.trim().to_lowercase().replace(' ', "_");
        if let Some(pod) = attachable_pod(&normalized) {
            selected.insert(pod.pod_id, pod);
        }
    }

    if let Some(ids) = industry_entry(INDUSTRY_PODS, industry) {
        for id in ids {
            if let Some(pod) = attachable_pod(id) {
                selected.insert(pod.pod_id, pod);
            }
        }
    }

    let lowered = intent_text.to_lowercase();
    for (pod_id, keywords) in POD_SIGNAL_KEYWORDS {
        if selected.contains_key(pod_id) {
            continue;
        }
        if keywords.iter().any(|kw| lowered.contains(kw)) {
            if let Some(pod) = attachable_pod(pod_id) {
                selected.insert(pod.pod_id, pod);
            }
        }
    }

    selected
}

/// Pick kernels: industry mapping first, then kernel tag signals in the text
/// (at most two), then the digital-product fallback.
pub fn select_kernels(industry: &str, intent_text: &str) -> Vec<&'static KernelSpec> {
    let mut ids: Vec<&'static str> = Vec::new();

    if let Some(mapped) = industry_entry(INDUSTRY_KERNELS, industry) {
        ids.extend(mapped.iter().copied());
    }

    if ids.is_empty() {
        let lowered = intent_text.to_lowercase();
        for spec in KERNELS {
            if spec.tags.iter().any(|tag| lowered.contains(tag)) {
                ids.push(spec.kernel_id);
                if ids.len() >= 2 {
                    break;
                }
            }
        }
    }

    if ids.is_empty() {
        ids.push(FALLBACK_KERNEL);
    }

    let mut out: Vec<&'static KernelSpec> = Vec::new();
    for id in ids {
        if let Some(spec) = kernel(id) {
            if !out.iter().any(|k| k.kernel_id == spec.kernel_id) {
                out.push(spec);
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
