//! Industry detection: an optional external classifier, backed by a weighted
//! keyword table.
//!
//! Keywords match at word starts in a normalized copy of the brief
//! (lowercase, punctuation folded to spaces), so `clinic` also hits
//! `clinics` and `clinical` but `ore` never hits `more`. A trailing space
//! in a keyword pins the word end. Generic words
//! carry small weights so they only decide the industry alongside a specific
//! signal.

use crate::error::Result;

/// Minimum summed weight for a keyword classification to count.
pub const INDUSTRY_THRESHOLD: f64 = 0.5;

/// Best-effort external classifier. Errors and empty answers fall back to the
/// keyword table.
pub trait IndustryClassifier: Send + Sync {
    fn classify(&self, text: &str) -> Result<String>;
}

/// Industry name → (keyword, weight). Names match `pods::INDUSTRY_KERNELS`.
pub const INDUSTRY_SIGNALS: &[(&str, &[(&str, f64)])] = &[
    (
        "Software / SaaS",
        &[
            ("saas", 1.0),
            ("software", 0.4),
            ("web app", 0.5),
            ("mobile app", 0.5),
            ("subscription", 0.3),
            ("platform", 0.2),
            ("app", 0.1),
        ],
    ),
    (
        "IT Services / Systems Integration",
        &[
            ("systems integration", 1.0),
            ("system integrator", 1.0),
            ("managed services", 0.8),
            ("it services", 0.8),
            ("erp rollout", 0.7),
            ("implementation partner", 0.6),
        ],
    ),
    (
        "Cloud / Data Centers",
        &[
            ("data center", 1.0),
            ("datacenter", 1.0),
            ("colocation", 0.8),
            ("hyperscale", 0.8),
            ("cloud infrastructure", 0.6),
            ("rack", 0.3),
        ],
    ),
    (
        "Cybersecurity (vendors)",
        &[
            ("cybersecurity", 1.0),
            ("siem", 0.8),
            ("threat detection", 0.8),
            ("endpoint protection", 0.8),
            ("penetration test", 0.6),
            ("security", 0.2),
        ],
    ),
    (
        "Telecommunications",
        &[
            ("telecom", 1.0),
            ("5g", 0.8),
            ("carrier", 0.4),
            ("spectrum", 0.5),
            ("cell tower", 0.8),
            ("fiber network", 0.7),
        ],
    ),
    (
        "Semiconductors",
        &[
            ("semiconductor", 1.0),
            ("wafer", 0.8),
            ("fab ", 0.6),
            ("lithography", 0.8),
            ("chip design", 0.8),
        ],
    ),
    (
        "Consumer Electronics",
        &[
            ("consumer electronics", 1.0),
            ("wearable", 0.7),
            ("smart home", 0.7),
            ("headphones", 0.6),
            ("gadget", 0.5),
        ],
    ),
    (
        "Automotive (OEM & mobility)",
        &[
            ("automotive", 1.0),
            ("vehicle", 0.5),
            ("oem", 0.4),
            ("ev charging", 0.7),
            ("adas", 0.8),
            ("car ", 0.3),
        ],
    ),
    (
        "Rail / Transit",
        &[
            ("railway", 1.0),
            ("rail", 0.6),
            ("transit", 0.6),
            ("metro", 0.4),
            ("signalling", 0.5),
            ("rolling stock", 0.8),
        ],
    ),
    (
        "Aerospace",
        &[
            ("aerospace", 1.0),
            ("aircraft", 0.8),
            ("avionics", 0.9),
            ("airline", 0.6),
            ("faa", 0.6),
        ],
    ),
    (
        "Space (launch/satellites)",
        &[
            ("satellite", 1.0),
            ("launch vehicle", 0.9),
            ("orbit", 0.7),
            ("spacecraft", 0.9),
            ("ground station", 0.7),
        ],
    ),
    (
        "Defense",
        &[
            ("defense", 0.8),
            ("defence", 0.8),
            ("military", 1.0),
            ("itar", 0.8),
            ("munitions", 0.9),
        ],
    ),
    (
        "Maritime / Shipping",
        &[
            ("maritime", 1.0),
            ("shipping line", 0.8),
            ("vessel", 0.7),
            ("port operations", 0.7),
            ("container ship", 0.9),
        ],
    ),
    (
        "Logistics / 3PL",
        &[
            ("logistics", 0.8),
            ("3pl", 1.0),
            ("warehouse", 0.6),
            ("fulfillment", 0.6),
            ("freight", 0.7),
            ("last mile", 0.6),
        ],
    ),
    (
        "Retail (physical)",
        &[
            ("retail store", 1.0),
            ("brick and mortar", 1.0),
            ("point of sale", 0.7),
            ("store operations", 0.7),
            ("retail", 0.4),
        ],
    ),
    (
        "E-commerce / Marketplaces",
        &[
            ("ecommerce", 1.0),
            ("e commerce", 1.0),
            ("marketplace", 0.8),
            ("online store", 0.9),
            ("shopping cart", 0.7),
            ("checkout", 0.4),
        ],
    ),
    (
        "Consumer Packaged Goods (CPG)",
        &[
            ("cpg", 1.0),
            ("consumer packaged goods", 1.0),
            ("fmcg", 1.0),
            ("packaging", 0.3),
            ("brand portfolio", 0.5),
        ],
    ),
    (
        "Food & Beverage Manufacturing",
        &[
            ("food and beverage", 1.0),
            ("food manufacturing", 1.0),
            ("brewery", 0.9),
            ("bottling", 0.8),
            ("food safety", 0.7),
            ("beverage", 0.5),
        ],
    ),
    (
        "Agriculture",
        &[
            ("agriculture", 1.0),
            ("farm", 0.7),
            ("crop", 0.8),
            ("livestock", 0.9),
            ("agritech", 1.0),
            ("irrigation", 0.6),
        ],
    ),
    (
        "Mining & Metals",
        &[
            ("mining", 1.0),
            ("ore", 0.5),
            ("smelter", 0.9),
            ("metals", 0.5),
            ("quarry", 0.8),
        ],
    ),
    (
        "Oil & Gas (upstream)",
        &[
            ("upstream", 0.6),
            ("drilling", 0.8),
            ("reservoir", 0.5),
            ("wellhead", 0.9),
            ("exploration and production", 1.0),
        ],
    ),
    (
        "Oil & Gas (midstream)",
        &[
            ("midstream", 1.0),
            ("pipeline operator", 0.9),
            ("gas storage", 0.7),
            ("lng", 0.8),
            ("compressor station", 0.8),
        ],
    ),
    (
        "Refining / Petrochemicals",
        &[
            ("refinery", 1.0),
            ("refining", 0.8),
            ("petrochemical", 1.0),
            ("cracker", 0.6),
        ],
    ),
    (
        "Chemicals (specialty/commodity)",
        &[
            ("chemical", 0.8),
            ("specialty chemicals", 1.0),
            ("reagent", 0.6),
            ("formulation", 0.5),
        ],
    ),
    (
        "Materials (advanced materials)",
        &[
            ("advanced materials", 1.0),
            ("composite", 0.6),
            ("polymer", 0.6),
            ("graphene", 0.9),
            ("coating", 0.4),
        ],
    ),
    (
        "Construction (GC / EPC)",
        &[
            ("construction", 0.8),
            ("general contractor", 1.0),
            ("epc", 0.8),
            ("building permit", 0.7),
            ("job site", 0.6),
        ],
    ),
    (
        "Real Estate (dev/property mgmt)",
        &[
            ("real estate", 1.0),
            ("property management", 1.0),
            ("tenant", 0.6),
            ("leasing", 0.4),
            ("landlord", 0.7),
        ],
    ),
    (
        "Utilities (electric/gas/water)",
        &[
            ("utility company", 1.0),
            ("water utility", 1.0),
            ("electric grid", 0.9),
            ("smart meter", 0.8),
            ("grid", 0.3),
        ],
    ),
    (
        "Power generation (incl. nuclear)",
        &[
            ("power plant", 1.0),
            ("nuclear", 1.0),
            ("power generation", 1.0),
            ("turbine", 0.5),
        ],
    ),
    (
        "Renewables (wind/solar/storage)",
        &[
            ("renewable", 0.9),
            ("solar", 0.8),
            ("wind farm", 1.0),
            ("battery storage", 0.8),
            ("photovoltaic", 1.0),
        ],
    ),
    (
        "Healthcare Providers (hospitals/clinics)",
        &[
            ("hospital", 1.0),
            ("clinic", 0.8),
            ("patient", 0.6),
            ("ehr", 0.8),
            ("telehealth", 0.9),
            ("nurse", 0.6),
            ("healthcare", 0.5),
        ],
    ),
    (
        "Health Insurance / Payers",
        &[
            ("health insurance", 1.0),
            ("payer", 0.8),
            ("claims adjudication", 1.0),
            ("medicaid", 0.9),
            ("medicare", 0.9),
        ],
    ),
    (
        "Medical Devices",
        &[
            ("medical device", 1.0),
            ("fda 510", 1.0),
            ("implant", 0.8),
            ("iec 62304", 1.0),
            ("diagnostic device", 0.9),
        ],
    ),
    (
        "Pharmaceuticals",
        &[
            ("pharma", 1.0),
            ("drug", 0.6),
            ("gmp", 0.8),
            ("formulary", 0.7),
            ("active ingredient", 0.7),
        ],
    ),
    (
        "Biotech",
        &[
            ("biotech", 1.0),
            ("genomic", 0.9),
            ("antibody", 0.8),
            ("cell therapy", 0.9),
            ("assay", 0.6),
        ],
    ),
    (
        "CRO / Clinical Trials Services",
        &[
            ("clinical trial", 1.0),
            ("cro", 0.6),
            ("trial site", 0.8),
            ("protocol deviation", 0.8),
            ("edc", 0.6),
        ],
    ),
    (
        "Banking (retail/commercial)",
        &[
            ("bank", 0.8),
            ("deposit", 0.5),
            ("loan", 0.6),
            ("kyc", 0.7),
            ("core banking", 1.0),
        ],
    ),
    (
        "Payments / Fintech",
        &[
            ("payment", 0.8),
            ("fintech", 1.0),
            ("wallet", 0.5),
            ("card issuing", 0.9),
            ("payment gateway", 0.6),
        ],
    ),
    (
        "Insurance",
        &[
            ("insurance", 0.8),
            ("underwriting", 1.0),
            ("policyholder", 0.9),
            ("actuarial", 0.9),
            ("claims", 0.4),
        ],
    ),
    (
        "Capital Markets / Asset Mgmt",
        &[
            ("asset management", 1.0),
            ("trading desk", 1.0),
            ("portfolio", 0.5),
            ("hedge fund", 1.0),
            ("securities", 0.7),
        ],
    ),
];

/// ` word word ` form: lowercase, non-alphanumerics folded to single spaces.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push(' ');
    let mut last_space = true;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    if !last_space {
        out.push(' ');
    }
    out
}

/// Sum of keyword weights for every industry, in table order.
pub fn industry_scores(text: &str) -> Vec<(&'static str, f64)> {
    let haystack = normalize(text);
    INDUSTRY_SIGNALS
        .iter()
        .map(|(name, keywords)| {
            let score = keywords
                .iter()
                .filter(|(kw, _)| haystack.contains(&format!(" {kw}")))
                .map(|(_, w)| *w)
                .sum::<f64>();
            (*name, score)
        })
        .collect()
}

/// Highest-scoring industry at or above [`INDUSTRY_THRESHOLD`]; ties go to
/// the earlier table entry. Empty when nothing clears the threshold.
pub fn classify_by_keywords(text: &str) -> String {
    let mut best: Option<(&str, f64)> = None;
    for (name, score) in industry_scores(text) {
        if score < INDUSTRY_THRESHOLD {
            continue;
        }
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((name, score)),
        }
    }
    best.map(|(name, _)| name.to_string()).unwrap_or_default()
}
