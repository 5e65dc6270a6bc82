//! Closed intent taxonomy and the intent → department routing table.
//!
//! Every intent belongs to exactly one department. Labels coming back from
//! the inference collaborator are resolved here; anything that does not
//! resolve becomes [`Intent::Unclassified`], which always routes to
//! [`Department::General`].

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

/// Routing department.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Department {
    Sales,
    Support,
    #[serde(rename = "HR", alias = "Hr", alias = "hr")]
    Hr,
    Legal,
    Operations,
    General,
}

impl Department {
    pub const ALL: [Department; 6] = [
        Department::Sales,
        Department::Support,
        Department::Hr,
        Department::Legal,
        Department::Operations,
        Department::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sales => "Sales",
            Self::Support => "Support",
            Self::Hr => "HR",
            Self::Legal => "Legal",
            Self::Operations => "Operations",
            Self::General => "General",
        }
    }
}

impl fmt::Display for Department {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! intents {
    ($($variant:ident => $label:literal, $dept:ident;)+) => {
        /// A business intent. The set is closed; see [`Taxonomy`] for label resolution.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum Intent {
            $(
                #[serde(rename = $label)]
                $variant,
            )+
        }

        impl Intent {
            /// Every intent, in declaration order.
            pub const ALL: &'static [Intent] = &[$(Intent::$variant),+];

            /// Canonical `Department.Name` label.
            pub fn label(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }

            /// The built-in department for this intent.
            pub fn default_department(&self) -> Department {
                match self {
                    $(Self::$variant => Department::$dept,)+
                }
            }
        }
    };
}

intents! {
    StrategicPartnership => "Sales.StrategicPartnership", Sales;
    InvestmentInquiry => "Sales.InvestmentInquiry", Sales;
    PartnershipRequest => "Sales.PartnershipRequest", Sales;
    TechnicalPartnership => "Sales.TechnicalPartnership", Sales;
    VipClientRequest => "Sales.VipClientRequest", Sales;
    EnterpriseDemo => "Sales.EnterpriseDemo", Sales;
    CustomSolution => "Sales.CustomSolution", Sales;
    PricingRequest => "Sales.PricingRequest", Sales;
    QuoteRequest => "Sales.QuoteRequest", Sales;
    PurchaseOrder => "Sales.PurchaseOrder", Sales;
    Upgrade => "Sales.Upgrade", Sales;
    Renewal => "Sales.Renewal", Sales;
    Cancellation => "Sales.Cancellation", Sales;

    TechnicalIssue => "Support.TechnicalIssue", Support;
    BugReport => "Support.BugReport", Support;
    FeatureRequest => "Support.FeatureRequest", Support;
    BillingQuestion => "Support.BillingQuestion", Support;
    InvoiceRequest => "Support.InvoiceRequest", Support;
    RefundRequest => "Support.RefundRequest", Support;
    AccessRequest => "Support.AccessRequest", Support;
    PasswordReset => "Support.PasswordReset", Support;
    AccountUpdate => "Support.AccountUpdate", Support;
    TrainingRequest => "Support.TrainingRequest", Support;
    SystemIntegration => "Support.SystemIntegration", Support;
    Escalation => "Support.Escalation", Support;

    JobApplication => "HR.JobApplication", Hr;
    InterviewScheduling => "HR.InterviewScheduling", Hr;
    ReferralSubmission => "HR.ReferralSubmission", Hr;
    ExecutiveRecruitment => "HR.ExecutiveRecruitment", Hr;
    LeaveRequest => "HR.LeaveRequest", Hr;
    PayrollQuestion => "HR.PayrollQuestion", Hr;
    BenefitsQuestion => "HR.BenefitsQuestion", Hr;

    LegalInquiry => "Legal.LegalInquiry", Legal;
    ContractRequest => "Legal.ContractRequest", Legal;
    ContractNegotiation => "Legal.ContractNegotiation", Legal;
    ComplianceQuestion => "Legal.ComplianceQuestion", Legal;
    PrivacyRequest => "Legal.PrivacyRequest", Legal;
    IntellectualProperty => "Legal.IntellectualProperty", Legal;
    RegulatoryUpdate => "Legal.RegulatoryUpdate", Legal;

    ExecutiveMeeting => "Operations.ExecutiveMeeting", Operations;
    DeliveryStatus => "Operations.DeliveryStatus", Operations;
    SecurityAlert => "Operations.SecurityAlert", Operations;
    VendorInquiry => "Operations.VendorInquiry", Operations;
    EnterpriseDeployment => "Operations.EnterpriseDeployment", Operations;
    DuplicateRequest => "Operations.DuplicateRequest", Operations;

    GeneralQuestion => "General.GeneralQuestion", General;
    FollowUp => "General.FollowUp", General;
    Feedback => "General.Feedback", General;
    MediaInquiry => "General.MediaInquiry", General;
    SpeakingEngagement => "General.SpeakingEngagement", General;
    ForwardToLeadership => "General.ForwardToLeadership", General;
    NoAction => "General.NoAction", General;
    Unclassified => "General.Unclassified", General;
}

impl Intent {
    /// The part of the label after the department, e.g. `Cancellation`.
    pub fn name(&self) -> &'static str {
        let label = self.label();
        label.split_once('.').map_or(label, |(_, name)| name)
    }

    /// snake_case form of [`Intent::name`], e.g. `pricing_request`.
    pub fn slug(&self) -> String {
        to_snake(self.name())
    }

    /// Intents that get flagged for executive attention.
    pub fn is_priority(&self) -> bool {
        matches!(
            self,
            Self::StrategicPartnership
                | Self::InvestmentInquiry
                | Self::ExecutiveMeeting
                | Self::VipClientRequest
        )
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Legacy command names still emitted by older prompts and dashboards.
const LEGACY_ALIASES: &[(&str, Intent)] = &[
    ("send_invoice", Intent::InvoiceRequest),
    ("account_closure", Intent::Cancellation),
    ("cancel_subscription", Intent::Cancellation),
    ("update_contact", Intent::AccountUpdate),
    ("change_account_details", Intent::AccountUpdate),
    ("board_communication", Intent::ForwardToLeadership),
    ("escalate_to_ceo", Intent::ForwardToLeadership),
    ("merger_acquisition", Intent::InvestmentInquiry),
    ("funding_discussion", Intent::InvestmentInquiry),
    ("investor_relations", Intent::InvestmentInquiry),
    ("strategic_consultation", Intent::CustomSolution),
    ("executive_escalation", Intent::Escalation),
    ("premium_support", Intent::TechnicalIssue),
    ("white_glove_service", Intent::VipClientRequest),
    ("conference_invite", Intent::SpeakingEngagement),
    ("thought_leadership", Intent::SpeakingEngagement),
    ("press_release", Intent::MediaInquiry),
    ("analyst_briefing", Intent::MediaInquiry),
    ("interview_schedule_request", Intent::InterviewScheduling),
    ("talent_acquisition", Intent::ExecutiveRecruitment),
    ("leadership_hiring", Intent::ExecutiveRecruitment),
    ("data_governance", Intent::ComplianceQuestion),
    ("privacy_policy_question", Intent::PrivacyRequest),
    ("ai_collaboration", Intent::TechnicalPartnership),
    ("innovation_project", Intent::TechnicalPartnership),
    ("research_proposal", Intent::TechnicalPartnership),
    ("technology_demo", Intent::EnterpriseDemo),
    ("proof_of_concept", Intent::EnterpriseDemo),
    ("beta_program", Intent::FeatureRequest),
    ("schedule_executive_review", Intent::ExecutiveMeeting),
    ("security_incident", Intent::SecurityAlert),
];

/// On-disk taxonomy table: extra aliases and department overrides.
///
/// ```json
/// { "aliases": { "terminate_contract": "Sales.Cancellation" },
///   "departments": { "Support.BillingQuestion": "Sales" } }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaxonomyTable {
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    #[serde(default)]
    pub departments: HashMap<String, Department>,
}

/// Label resolution plus the (total) routing table.
#[derive(Debug, Clone)]
pub struct Taxonomy {
    lookup: HashMap<String, Intent>,
    departments: HashMap<Intent, Department>,
}

impl Taxonomy {
    /// Built-in taxonomy with legacy aliases and default routing.
    pub fn standard() -> Self {
        let mut lookup = HashMap::new();
        for intent in Intent::ALL {
            lookup.insert(intent.slug(), *intent);
            lookup.insert(normalize_label(intent.label()), *intent);
        }
        for (alias, intent) in LEGACY_ALIASES {
            lookup.insert((*alias).to_string(), *intent);
        }
        let departments = Intent::ALL
            .iter()
            .map(|i| (*i, i.default_department()))
            .collect();
        Self {
            lookup,
            departments,
        }
    }

    /// Standard taxonomy extended with a configured table.
    pub fn with_table(table: &TaxonomyTable) -> Result<Self, ConfigError> {
        let mut taxonomy = Self::standard();

        for (alias, target) in &table.aliases {
            let intent = taxonomy
                .resolve(target)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: format!("aliases.{alias}"),
                    message: format!("'{target}' is not an intent"),
                })?;
            taxonomy.lookup.insert(normalize_label(alias), intent);
        }

        for (label, department) in &table.departments {
            let intent = taxonomy
                .resolve(label)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: format!("departments.{label}"),
                    message: format!("'{label}' is not an intent"),
                })?;
            if intent == Intent::Unclassified && *department != Department::General {
                return Err(ConfigError::InvalidValue {
                    key: format!("departments.{label}"),
                    message: "unclassified always routes to General".into(),
                });
            }
            taxonomy.departments.insert(intent, *department);
        }

        Ok(taxonomy)
    }

    /// Load a taxonomy table from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let table: TaxonomyTable = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;
        Self::with_table(&table)
    }

    /// Resolve a free-form label to an intent, if it names one.
    ///
    /// Accepts `Department.Name`, `Name`, `snake_case` and configured aliases,
    /// case-insensitively.
    pub fn resolve(&self, label: &str) -> Option<Intent> {
        let normalized = normalize_label(label);
        if normalized.is_empty() {
            return None;
        }
        if let Some(intent) = self.lookup.get(&normalized) {
            return Some(*intent);
        }
        // "Support.Cancellation": the department half is derived, not trusted.
        let (_, name) = normalized.rsplit_once('.')?;
        self.lookup.get(name).copied()
    }

    /// Resolve a label, falling back to `Unclassified` for anything unknown.
    ///
    /// Returns the intent and whether the fallback was taken.
    pub fn resolve_or_unclassified(&self, label: &str) -> (Intent, bool) {
        match self.resolve(label) {
            Some(intent) => (intent, false),
            None => {
                warn!(label = %label, "Label outside taxonomy, mapping to unclassified");
                (Intent::Unclassified, true)
            }
        }
    }

    /// Department for an intent. Total over [`Intent::ALL`].
    pub fn department(&self, intent: Intent) -> Department {
        self.departments
            .get(&intent)
            .copied()
            .unwrap_or_else(|| intent.default_department())
    }

    /// Canonical labels offered to the model (excludes the reserved fallback).
    pub fn prompt_labels(&self) -> Vec<&'static str> {
        Intent::ALL
            .iter()
            .filter(|i| **i != Intent::Unclassified)
            .map(|i| i.label())
            .collect()
    }
}

impl Default for Taxonomy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Lowercase, strip quotes/brackets, unify separators to `_`.
///
/// Acronym runs split before their last capital: `VIPClient` is `vip_client`.
fn normalize_label(label: &str) -> String {
    let trimmed = label
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c == '[' || c == ']')
        .trim();
    let mut out = String::with_capacity(trimmed.len());
    let mut prev_lower = false;
    let mut prev_upper = false;
    let mut chars = trimmed.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == ' ' || ch == '-' || ch == '_' {
            if !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
            prev_lower = false;
            prev_upper = false;
        } else if ch == '.' {
            out.push('.');
            prev_lower = false;
            prev_upper = false;
        } else if ch.is_uppercase() {
            let ends_acronym = prev_upper && chars.peek().is_some_and(|next| next.is_lowercase());
            if prev_lower || ends_acronym {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
            prev_lower = false;
            prev_upper = true;
        } else {
            out.push(ch);
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
            prev_upper = false;
        }
    }
    out.trim_matches('_').to_string()
}

fn to_snake(name: &str) -> String {
    normalize_label(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_has_at_least_forty_business_intents() {
        let business = Intent::ALL
            .iter()
            .filter(|i| **i != Intent::Unclassified)
            .count();
        assert!(business >= 40, "only {business} intents");
    }

    #[test]
    fn every_intent_has_exactly_one_department() {
        let taxonomy = Taxonomy::standard();
        for intent in Intent::ALL {
            let dept = taxonomy.department(*intent);
            assert_eq!(dept, taxonomy.department(*intent));
            assert!(intent.label().starts_with(dept.as_str()), "{intent}");
        }
    }

    #[test]
    fn unclassified_routes_to_general() {
        assert_eq!(
            Taxonomy::standard().department(Intent::Unclassified),
            Department::General
        );
    }

    #[test]
    fn resolves_dotted_snake_and_alias_forms() {
        let t = Taxonomy::standard();
        assert_eq!(t.resolve("Sales.Cancellation"), Some(Intent::Cancellation));
        assert_eq!(t.resolve("cancellation"), Some(Intent::Cancellation));
        assert_eq!(t.resolve("\"account_closure\""), Some(Intent::Cancellation));
        assert_eq!(t.resolve("pricing request"), Some(Intent::PricingRequest));
        assert_eq!(t.resolve("PricingRequest"), Some(Intent::PricingRequest));
        assert_eq!(t.resolve("hr.job-application"), Some(Intent::JobApplication));
    }

    #[test]
    fn acronym_runs_split_before_the_next_word() {
        let t = Taxonomy::standard();
        assert_eq!(normalize_label("VIPClientRequest"), "vip_client_request");
        assert_eq!(normalize_label("HRPolicy"), "hr_policy");
        assert_eq!(t.resolve("VIPClientRequest"), Some(Intent::VipClientRequest));
        assert_eq!(t.resolve("Sales.VIPClientRequest"), Some(Intent::VipClientRequest));
        assert_eq!(t.resolve("VIP"), None);
    }

    #[test]
    fn wrong_department_prefix_still_resolves_by_name() {
        let t = Taxonomy::standard();
        assert_eq!(t.resolve("Support.Cancellation"), Some(Intent::Cancellation));
    }

    #[test]
    fn unknown_label_falls_back_to_unclassified() {
        let t = Taxonomy::standard();
        assert_eq!(t.resolve("launch_rocket"), None);
        assert_eq!(
            t.resolve_or_unclassified("launch_rocket"),
            (Intent::Unclassified, true)
        );
        assert_eq!(t.resolve_or_unclassified(""), (Intent::Unclassified, true));
    }

    #[test]
    fn table_adds_aliases_and_overrides_departments() {
        let table = TaxonomyTable {
            aliases: HashMap::from([("terminate contract".into(), "Sales.Cancellation".into())]),
            departments: HashMap::from([("Support.BillingQuestion".into(), Department::Sales)]),
        };
        let t = Taxonomy::with_table(&table).unwrap();
        assert_eq!(t.resolve("terminate_contract"), Some(Intent::Cancellation));
        assert_eq!(t.department(Intent::BillingQuestion), Department::Sales);
    }

    #[test]
    fn table_rejects_unknown_alias_target() {
        let table = TaxonomyTable {
            aliases: HashMap::from([("x".into(), "Nope.Nothing".into())]),
            departments: HashMap::new(),
        };
        assert!(Taxonomy::with_table(&table).is_err());
    }

    #[test]
    fn table_cannot_move_unclassified() {
        let table = TaxonomyTable {
            aliases: HashMap::new(),
            departments: HashMap::from([("General.Unclassified".into(), Department::Legal)]),
        };
        assert!(Taxonomy::with_table(&table).is_err());
    }

    #[test]
    fn intent_serializes_as_dotted_label() {
        let json = serde_json::to_string(&Intent::Cancellation).unwrap();
        assert_eq!(json, "\"Sales.Cancellation\"");
        let dept = serde_json::to_string(&Department::Hr).unwrap();
        assert_eq!(dept, "\"HR\"");
    }

    #[test]
    fn slugs_are_snake_case() {
        assert_eq!(Intent::VipClientRequest.slug(), "vip_client_request");
        assert_eq!(Intent::Cancellation.slug(), "cancellation");
    }
}
