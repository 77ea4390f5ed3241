use crate::utils::{fold_label, is_not_informed, parse_amount, NOT_INFORMED};
use schemars::JsonSchema;
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Model-facing shape. Everything is optional and leniently typed: the record
// validator decides what is required and what degrades to a sentinel.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RawExtraction {
    #[serde(default, alias = "competencia", deserialize_with = "lenient_string")]
    #[schemars(description = "Competency period of the statement, always formatted as MM/YYYY (e.g. '09/2025')")]
    pub competency: Option<String>,

    #[serde(default, alias = "codigo_obra", deserialize_with = "lenient_string")]
    #[schemars(description = "Project code exactly as printed in the title (e.g. '616', '562', 'BCO')")]
    pub project_code: Option<String>,

    #[serde(default, alias = "nome_obra", alias = "obra_nome", deserialize_with = "lenient_string")]
    #[schemars(description = "Full project name, if printed")]
    pub project_name: Option<String>,

    #[serde(default, alias = "tipo_documento", deserialize_with = "lenient_string")]
    #[schemars(description = "Either 'POSITION_STATEMENT' (consolidated financial position) or 'EXPENSE_DETAIL' (invoice-by-invoice expense listing)")]
    pub document_type: Option<String>,

    #[serde(default, alias = "saldo_inicial", deserialize_with = "lenient_amount")]
    #[schemars(description = "Opening balance with 2 decimals, or 'not_informed'")]
    pub opening_balance: Option<f64>,

    #[serde(default, alias = "saldo_final", deserialize_with = "lenient_amount")]
    #[schemars(description = "Closing balance with 2 decimals, or 'not_informed'")]
    pub closing_balance: Option<f64>,

    #[serde(default, alias = "despesas", deserialize_with = "null_as_empty")]
    #[schemars(description = "Every expense line found in the document, in document order")]
    pub expenses: Vec<RawExpense>,

    #[serde(default, alias = "despesas_total", deserialize_with = "lenient_amount")]
    #[schemars(description = "Sum of all expense amounts")]
    pub expenses_total: Option<f64>,

    #[serde(default, alias = "receitas", deserialize_with = "null_as_empty")]
    #[schemars(description = "Every revenue line (pool contributions, profitability, reimbursements)")]
    pub revenues: Vec<RawRevenue>,

    #[serde(default, alias = "receitas_total", deserialize_with = "lenient_amount")]
    #[schemars(description = "Sum of all revenue amounts")]
    pub revenues_total: Option<f64>,

    #[serde(default, alias = "aportes_pool", deserialize_with = "lenient_object")]
    #[schemars(description = "Pooled contribution allocation, when the document reports pool contributions")]
    pub pooled_contribution: Option<RawPooledContribution>,

    #[serde(default, alias = "conciliacao_bancaria", deserialize_with = "lenient_object")]
    #[schemars(description = "Bank reconciliation figures, when present")]
    pub bank_reconciliation: Option<RawBankReconciliation>,

    #[serde(default, alias = "qualidade_extracao", deserialize_with = "lenient_string")]
    #[schemars(description = "Self-assessed quality: 'COMPLETE', 'PARTIAL_MISSING_FIELDS' or 'ERROR_CRITICAL_FIELD_MISSING'")]
    pub extraction_quality: Option<String>,

    #[serde(default, alias = "observacoes", deserialize_with = "lenient_string")]
    #[schemars(description = "Free-text remarks worth a reviewer's attention")]
    pub notes: Option<String>,

    #[serde(default, alias = "alertas", deserialize_with = "null_as_empty")]
    #[schemars(description = "Alert flags raised during extraction (e.g. 'opening_balance_not_informed')")]
    pub alerts: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RawExpense {
    #[serde(default, alias = "descricao", deserialize_with = "lenient_string")]
    #[schemars(description = "Exact description, e.g. 'Vendor X - Service Y'")]
    pub description: Option<String>,

    #[serde(default, alias = "valor", deserialize_with = "lenient_amount")]
    #[schemars(description = "Exact amount, never rounded")]
    pub amount: Option<f64>,

    #[serde(default, alias = "categoria", deserialize_with = "lenient_string")]
    #[schemars(description = "One of 'Material', 'Labor', 'Services', 'Rental', 'Other'")]
    pub category: Option<String>,

    #[serde(default, alias = "fornecedor", deserialize_with = "lenient_string")]
    #[schemars(description = "Vendor name exactly as printed")]
    pub vendor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RawRevenue {
    #[serde(default, rename = "type", alias = "tipo", deserialize_with = "lenient_string")]
    #[schemars(description = "Revenue kind, e.g. 'Contribution', 'Profitability', 'Reimbursement'")]
    pub kind: Option<String>,

    #[serde(default, alias = "valor", deserialize_with = "lenient_amount")]
    #[schemars(description = "Exact amount")]
    pub amount: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RawPooledContribution {
    #[serde(default, alias = "valor_total_pool", deserialize_with = "lenient_amount")]
    #[schemars(description = "Total contribution received by the pool this month")]
    pub total_pool_amount: Option<f64>,

    #[serde(default, alias = "despesas_todas_obras", deserialize_with = "lenient_amount")]
    #[schemars(description = "Total monthly expense across all projects sharing the pool")]
    pub all_documents_expense_total: Option<f64>,

    #[serde(default, alias = "taxa_rateio_esta_obra", deserialize_with = "lenient_amount")]
    #[schemars(description = "This project's expense divided by the total expense of all projects")]
    pub this_document_ratio: Option<f64>,

    #[serde(default, alias = "valor_rateado_esta_obra", deserialize_with = "lenient_amount")]
    #[schemars(description = "total_pool_amount multiplied by this_document_ratio")]
    pub allocated_amount: Option<f64>,

    #[serde(default, alias = "metodo_calculo", deserialize_with = "lenient_string")]
    #[schemars(description = "Allocation method description")]
    pub method: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RawBankReconciliation {
    #[serde(default, alias = "saldo_banco", deserialize_with = "lenient_amount")]
    #[schemars(description = "Balance reported by the bank")]
    pub bank_balance: Option<f64>,

    #[serde(default, alias = "saldo_sistema", deserialize_with = "lenient_amount")]
    #[schemars(description = "Balance according to the accounting system")]
    pub system_balance: Option<f64>,

    #[serde(default, alias = "diferenca", deserialize_with = "lenient_amount")]
    #[schemars(description = "bank_balance minus system_balance")]
    pub difference: Option<f64>,

    #[serde(default, deserialize_with = "lenient_string")]
    #[schemars(description = "'reconciled' or 'divergent'")]
    pub status: Option<String>,
}

impl RawExtraction {
    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(RawExtraction)
    }

    pub fn schema_as_json() -> Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}

fn lenient_amount<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(parse_amount(&value))
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return Ok(None),
    };
    if is_not_informed(&text) {
        Ok(None)
    } else {
        Ok(Some(text))
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    match Value::deserialize(deserializer)? {
        value @ Value::Array(_) => serde_json::from_value(value).map_err(de::Error::custom),
        _ => Ok(Vec::new()),
    }
}

fn lenient_object<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    match Value::deserialize(deserializer)? {
        value @ Value::Object(_) => serde_json::from_value(value)
            .map(Some)
            .map_err(de::Error::custom),
        _ => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Validated record.
// ---------------------------------------------------------------------------

/// A currency amount that the source document may not carry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Amount {
    Value(f64),
    NotInformed,
}

impl Amount {
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Value(v) => Some(*v),
            Self::NotInformed => None,
        }
    }
}

impl From<Option<f64>> for Amount {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Self::NotInformed, Self::Value)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Value(v) => serializer.serialize_f64(*v),
            Self::NotInformed => serializer.serialize_str(NOT_INFORMED),
        }
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(parse_amount(&value).into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentType {
    PositionStatement,
    ExpenseDetail,
}

impl DocumentType {
    pub fn from_label(label: &str) -> Option<Self> {
        let folded = fold_label(label);
        if folded.contains("posic") || folded.contains("position") {
            Some(Self::PositionStatement)
        } else if folded.contains("despes") || folded.contains("expense") {
            Some(Self::ExpenseDetail)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpenseCategory {
    Material,
    Labor,
    Services,
    Rental,
    Other,
}

impl ExpenseCategory {
    /// Maps a model label to a category. `None` when the label is unknown,
    /// so the caller can flag it before falling back to `Other`.
    pub fn from_label(label: &str) -> Option<Self> {
        match fold_label(label).as_str() {
            "material" | "materiais" | "materials" => Some(Self::Material),
            "mo" | "maodeobra" | "labor" | "labour" => Some(Self::Labor),
            "servicos" | "servico" | "services" | "service" => Some(Self::Services),
            "locacao" | "locacoes" | "rental" | "rent" => Some(Self::Rental),
            "outros" | "outro" | "other" | "others" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractionQuality {
    Complete,
    PartialMissingFields,
    ErrorCriticalFieldMissing,
}

impl ExtractionQuality {
    pub fn from_label(label: &str) -> Option<Self> {
        let folded = fold_label(label);
        if folded.contains("complet") {
            Some(Self::Complete)
        } else if folded.contains("parcial") || folded.contains("partial") {
            Some(Self::PartialMissingFields)
        } else if folded.contains("erro") || folded.contains("error") {
            Some(Self::ErrorCriticalFieldMissing)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MovementType {
    Expense,
    ProratedContribution,
    Profitability,
    ClosingBalance,
    Other,
}

impl MovementType {
    pub const ALL: [MovementType; 5] = [
        Self::Expense,
        Self::ProratedContribution,
        Self::Profitability,
        Self::ClosingBalance,
        Self::Other,
    ];

    /// Never fails: anything unrecognized is `Other`.
    pub fn from_label(label: &str) -> Self {
        let folded = fold_label(label);
        match folded.as_str() {
            "despesa" | "despesas" | "expense" | "expenses" => Self::Expense,
            "aporterateado" | "proratedcontribution" | "aporte" | "aportes" | "contribution"
            | "poolcontribution" | "aportepool" => Self::ProratedContribution,
            "rentabilidade" | "profitability" | "rendimento" | "rendimentos" | "yield" => {
                Self::Profitability
            }
            "saldofinal" | "closingbalance" => Self::ClosingBalance,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expense => "Expense",
            Self::ProratedContribution => "ProratedContribution",
            Self::Profitability => "Profitability",
            Self::ClosingBalance => "ClosingBalance",
            Self::Other => "Other",
        }
    }
}

impl std::fmt::Display for MovementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseLine {
    pub description: String,
    pub amount: f64,
    pub category: ExpenseCategory,
    pub vendor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevenueLine {
    pub kind: String,
    pub amount: f64,
    pub movement_type: MovementType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PooledContribution {
    pub total_pool_amount: f64,
    pub all_documents_expense_total: f64,
    /// Recomputed from this document's expense total.
    pub this_document_ratio: f64,
    pub allocated_amount: f64,
    pub method: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Reconciled,
    Divergent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankReconciliation {
    pub bank_balance: Amount,
    pub system_balance: Amount,
    pub difference: f64,
    pub status: ReconciliationStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStatus {
    Ok,
    AuditRequired,
    /// Opening or closing balance not informed.
    NotVerifiable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceCheck {
    pub expected_closing: Option<f64>,
    pub difference: Option<f64>,
    pub status: BalanceStatus,
}

/// Non-fatal findings attached to a validated record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "flag", rename_all = "snake_case")]
pub enum AuditFlag {
    /// Closing balance diverges from opening + revenues - expenses beyond tolerance.
    AuditRequired {
        expected_closing: f64,
        reported_closing: f64,
        difference: f64,
    },
    TotalMismatch {
        field: String,
        reported: f64,
        computed: f64,
    },
    PooledAllocationMismatch {
        reported: f64,
        computed: f64,
    },
    ReconciliationDivergence {
        difference: f64,
    },
    MissingField {
        field: String,
    },
    UnrecognizedValue {
        field: String,
        value: String,
    },
    ModelAlert {
        message: String,
    },
}

impl AuditFlag {
    /// Flags that need a human reviewer before the figures are trusted.
    pub fn requires_review(&self) -> bool {
        matches!(
            self,
            Self::AuditRequired { .. } | Self::ReconciliationDivergence { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialStatementExtraction {
    pub competency: String,
    pub project_code: String,
    pub project_name: Option<String>,
    pub document_type: Option<DocumentType>,
    pub opening_balance: Amount,
    pub closing_balance: Amount,
    pub expenses: Vec<ExpenseLine>,
    pub expenses_total: f64,
    pub revenues: Vec<RevenueLine>,
    pub revenues_total: f64,
    pub pooled_contribution: Option<PooledContribution>,
    pub bank_reconciliation: Option<BankReconciliation>,
    pub balance_check: BalanceCheck,
    pub extraction_quality: ExtractionQuality,
    pub notes: Option<String>,
    pub audit_flags: Vec<AuditFlag>,
}

impl FinancialStatementExtraction {
    pub fn requires_audit(&self) -> bool {
        self.audit_flags.iter().any(AuditFlag::requires_review)
    }

    pub fn revenue_total_for(&self, movement_type: MovementType) -> f64 {
        self.revenues
            .iter()
            .filter(|r| r.movement_type == movement_type)
            .map(|r| r.amount)
            .sum()
    }
}
