//! Built-in metric catalog plus loading from a definition feed file.
//!
//! The built-in set covers the default valuation config: a quantitative
//! tree built from statement fundamentals and a qualitative tree built
//! from consensus state. A `--metrics PATH` feed file replaces it
//! wholesale; the format is the same JSON array of definition records.

use appraisal_core::ValuationError;
use metric_engine::MetricDefinitionRecord;

const DEFAULT_CATALOG: &str = r#"[
  {"id": "revenue", "domain": "quantitative-profitability", "source": "rawField",
   "responseKey": "incomeStatement", "apiFieldPath": "revenues.value"},
  {"id": "net_income", "domain": "quantitative-profitability", "source": "rawField",
   "responseKey": "incomeStatement", "apiFieldPath": "net_income_loss.value"},
  {"id": "eps", "domain": "quantitative-profitability", "source": "rawField",
   "responseKey": "incomeStatement", "apiFieldPath": "basic_earnings_per_share.value"},
  {"id": "ttm_revenue", "domain": "quantitative-profitability", "source": "aggregation",
   "baseMetricId": "revenue", "aggregationKind": "trailing-twelve-month"},
  {"id": "ttm_net_income", "domain": "quantitative-profitability", "source": "aggregation",
   "baseMetricId": "net_income", "aggregationKind": "trailing-twelve-month"},
  {"id": "ttm_eps", "domain": "quantitative-profitability", "source": "aggregation",
   "baseMetricId": "eps", "aggregationKind": "trailing-twelve-month"},
  {"id": "profit_margin", "domain": "quantitative-profitability", "source": "expression",
   "expression": "ttm_net_income / ttm_revenue"},

  {"id": "total_liabilities", "domain": "quantitative-risk", "source": "rawField",
   "responseKey": "balanceSheet", "apiFieldPath": "liabilities.value"},
  {"id": "shareholders_equity", "domain": "quantitative-risk", "source": "rawField",
   "responseKey": "balanceSheet", "apiFieldPath": "equity.value"},
  {"id": "debt_to_equity", "domain": "quantitative-risk", "source": "expression",
   "expression": "total_liabilities / shareholders_equity"},

  {"id": "current_price", "domain": "quantitative-valuation", "source": "rawField",
   "responseKey": "snapshot", "apiFieldPath": "last_price"},
  {"id": "pe_ratio", "domain": "quantitative-valuation", "source": "expression",
   "expression": "current_price / ttm_eps"},
  {"id": "fair_value", "domain": "quantitative-valuation", "source": "expression",
   "expression": "ttm_eps * 15 * (1 + ttm_net_income / ttm_revenue)"},

  {"id": "consensus_target", "domain": "qualitative-consensus", "source": "rawField",
   "responseKey": "consensus", "apiFieldPath": "consensus_price_target"},
  {"id": "analyst_target_mean", "domain": "qualitative-consensus", "source": "custom"},
  {"id": "analyst_count", "domain": "qualitative-consensus", "source": "custom"},
  {"id": "revision_balance", "domain": "qualitative-consensus", "source": "custom"},
  {"id": "target_upside", "domain": "qualitative-consensus", "source": "expression",
   "expression": "analyst_target_mean / current_price - 1"},

  {"id": "event_target", "domain": "qualitative-event", "source": "custom"},
  {"id": "event_reference", "domain": "qualitative-event", "source": "custom"},
  {"id": "event_implied_move", "domain": "qualitative-event", "source": "expression",
   "expression": "event_target / event_reference - 1"}
]"#;

/// The default definition records, used when no feed file is given.
pub fn default_catalog() -> Result<Vec<MetricDefinitionRecord>, ValuationError> {
    serde_json::from_str(DEFAULT_CATALOG)
        .map_err(|e| ValuationError::InvalidConfiguration(format!("built-in catalog: {}", e)))
}

/// Load definition records from a JSON feed file.
pub fn load_catalog(path: &str) -> Result<Vec<MetricDefinitionRecord>, ValuationError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ValuationError::InvalidConfiguration(format!("cannot read metric feed {}: {}", path, e))
    })?;
    serde_json::from_str(&raw)
        .map_err(|e| ValuationError::InvalidConfiguration(format!("metric feed {}: {}", path, e)))
}
