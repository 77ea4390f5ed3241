use crate::error::{IngestError, Result};
use crate::schema::{
    Amount, AuditFlag, BalanceCheck, BalanceStatus, BankReconciliation, DocumentType,
    ExpenseCategory, ExpenseLine, ExtractionQuality, FinancialStatementExtraction, MovementType,
    PooledContribution, RawBankReconciliation, RawExtraction, RawPooledContribution,
    ReconciliationStatus, RevenueLine,
};
use crate::utils::{normalize_competency, round_cents, truncate_chars, NOT_INFORMED};
use log::{debug, warn};
use serde_json::Value;

const DEFAULT_ALLOCATION_METHOD: &str = "Proportional to monthly expenses";

/// Tolerances applied when checking a record for internal consistency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationPolicy {
    /// Allowed divergence, in currency units, between the reported closing
    /// balance and opening + revenues - expenses.
    pub balance_tolerance: f64,
    /// Allowed relative difference between a reported total and the sum of
    /// its lines.
    pub total_relative_epsilon: f64,
    /// Allowed divergence, in currency units, for the pooled allocation.
    pub allocation_tolerance: f64,
    /// Bank vs. system differences above this are flagged for review.
    pub reconciliation_alert_threshold: f64,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            balance_tolerance: 1.00,
            total_relative_epsilon: 0.001,
            allocation_tolerance: 1.00,
            reconciliation_alert_threshold: 100.00,
        }
    }
}

pub struct RecordValidator {
    policy: ValidationPolicy,
}

impl Default for RecordValidator {
    fn default() -> Self {
        Self::new(ValidationPolicy::default())
    }
}

impl RecordValidator {
    pub fn new(policy: ValidationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Validates a parsed model payload. Accepts a single record or an array
    /// of records; one document may cover several project codes.
    pub fn validate(&self, payload: &Value) -> Result<Vec<FinancialStatementExtraction>> {
        let items: Vec<&Value> = match payload {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };

        if items.is_empty() {
            return Err(IngestError::UnparsableModelOutput {
                reason: "model returned an empty array".to_string(),
                snippet: payload.to_string(),
            });
        }

        items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                if !item.is_object() {
                    return Err(IngestError::UnparsableModelOutput {
                        reason: format!("record #{} is not a JSON object", index),
                        snippet: truncate_chars(&item.to_string(), 200),
                    });
                }
                let raw: RawExtraction = serde_json::from_value(item.clone())?;
                self.validate_record(raw, index)
            })
            .collect()
    }

    pub fn validate_record(
        &self,
        raw: RawExtraction,
        index: usize,
    ) -> Result<FinancialStatementExtraction> {
        let competency = raw
            .competency
            .as_deref()
            .ok_or(IngestError::MissingRequiredField {
                field: "competency",
                index,
            })
            .and_then(normalize_competency)?;

        let project_code = raw
            .project_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .ok_or(IngestError::MissingRequiredField {
                field: "project_code",
                index,
            })?
            .to_string();

        let mut flags = Vec::new();

        let document_type = raw.document_type.as_deref().and_then(|label| {
            let parsed = DocumentType::from_label(label);
            if parsed.is_none() {
                flags.push(AuditFlag::UnrecognizedValue {
                    field: "document_type".to_string(),
                    value: label.to_string(),
                });
            }
            parsed
        });

        let opening_balance = Amount::from(raw.opening_balance);
        let closing_balance = Amount::from(raw.closing_balance);
        for (field, amount) in [
            ("opening_balance", opening_balance),
            ("closing_balance", closing_balance),
        ] {
            if amount == Amount::NotInformed {
                flags.push(AuditFlag::MissingField {
                    field: field.to_string(),
                });
            }
        }

        let expenses: Vec<ExpenseLine> = raw
            .expenses
            .into_iter()
            .enumerate()
            .map(|(i, line)| {
                let amount = line.amount.unwrap_or_else(|| {
                    flags.push(AuditFlag::MissingField {
                        field: format!("expenses[{}].amount", i),
                    });
                    0.0
                });
                let category = match line.category.as_deref() {
                    None => ExpenseCategory::Other,
                    Some(label) => ExpenseCategory::from_label(label).unwrap_or_else(|| {
                        flags.push(AuditFlag::UnrecognizedValue {
                            field: format!("expenses[{}].category", i),
                            value: label.to_string(),
                        });
                        ExpenseCategory::Other
                    }),
                };
                ExpenseLine {
                    description: line.description.unwrap_or_else(|| NOT_INFORMED.to_string()),
                    amount,
                    category,
                    vendor: line.vendor,
                }
            })
            .collect();

        let revenues: Vec<RevenueLine> = raw
            .revenues
            .into_iter()
            .enumerate()
            .map(|(i, line)| {
                let amount = line.amount.unwrap_or_else(|| {
                    flags.push(AuditFlag::MissingField {
                        field: format!("revenues[{}].amount", i),
                    });
                    0.0
                });
                let kind = line.kind.unwrap_or_else(|| NOT_INFORMED.to_string());
                RevenueLine {
                    movement_type: MovementType::from_label(&kind),
                    kind,
                    amount,
                }
            })
            .collect();

        let expenses_total = self.reconcile_total(
            "expenses_total",
            expenses.iter().map(|e| e.amount),
            raw.expenses_total,
            &mut flags,
        );
        let revenues_total = self.reconcile_total(
            "revenues_total",
            revenues.iter().map(|r| r.amount),
            raw.revenues_total,
            &mut flags,
        );

        let pooled_contribution = raw
            .pooled_contribution
            .and_then(|pool| self.allocate_pool(pool, expenses_total, &mut flags));

        let bank_reconciliation = raw
            .bank_reconciliation
            .map(|bank| self.reconcile_bank(bank, &mut flags));

        let (balance_check, balance_flag) = self.check_balance(
            opening_balance,
            closing_balance,
            revenues_total,
            expenses_total,
        );
        if let Some(flag) = balance_flag {
            warn!(
                "Project {} ({}): closing balance fails the accounting identity, audit required",
                project_code, competency
            );
            flags.push(flag);
        }

        flags.extend(
            raw.alerts
                .into_iter()
                .map(|message| AuditFlag::ModelAlert { message }),
        );

        let has_missing_fields = flags
            .iter()
            .any(|f| matches!(f, AuditFlag::MissingField { .. }));
        let extraction_quality = raw
            .extraction_quality
            .as_deref()
            .and_then(ExtractionQuality::from_label)
            .unwrap_or(if has_missing_fields {
                ExtractionQuality::PartialMissingFields
            } else {
                ExtractionQuality::Complete
            });

        debug!(
            "Validated record #{}: project {} competency {} with {} expenses, {} revenues, {} flags",
            index,
            project_code,
            competency,
            expenses.len(),
            revenues.len(),
            flags.len()
        );

        Ok(FinancialStatementExtraction {
            competency,
            project_code,
            project_name: raw.project_name,
            document_type,
            opening_balance,
            closing_balance,
            expenses,
            expenses_total,
            revenues,
            revenues_total,
            pooled_contribution,
            bank_reconciliation,
            balance_check,
            extraction_quality,
            notes: raw.notes,
            audit_flags: flags,
        })
    }

    /// Checks `closing = opening + revenues - expenses` within the balance
    /// tolerance. Returns the `AuditRequired` flag on divergence.
    pub fn check_balance(
        &self,
        opening: Amount,
        closing: Amount,
        revenues_total: f64,
        expenses_total: f64,
    ) -> (BalanceCheck, Option<AuditFlag>) {
        let (Some(opening), Some(closing)) = (opening.value(), closing.value()) else {
            return (
                BalanceCheck {
                    expected_closing: None,
                    difference: None,
                    status: BalanceStatus::NotVerifiable,
                },
                None,
            );
        };

        let expected = round_cents(opening + revenues_total - expenses_total);
        let difference = round_cents(closing - expected);

        if difference.abs() > self.policy.balance_tolerance {
            (
                BalanceCheck {
                    expected_closing: Some(expected),
                    difference: Some(difference),
                    status: BalanceStatus::AuditRequired,
                },
                Some(AuditFlag::AuditRequired {
                    expected_closing: expected,
                    reported_closing: closing,
                    difference,
                }),
            )
        } else {
            (
                BalanceCheck {
                    expected_closing: Some(expected),
                    difference: Some(difference),
                    status: BalanceStatus::Ok,
                },
                None,
            )
        }
    }

    /// Sums the itemized lines; when there are none, the reported total is
    /// all we have.
    fn reconcile_total(
        &self,
        field: &str,
        amounts: impl Iterator<Item = f64>,
        reported: Option<f64>,
        flags: &mut Vec<AuditFlag>,
    ) -> f64 {
        let mut count = 0;
        let computed = round_cents(amounts.inspect(|_| count += 1).sum());

        if count == 0 {
            return reported.unwrap_or(0.0);
        }

        if let Some(reported) = reported {
            let relative = (reported - computed).abs() / computed.abs().max(1.0);
            if relative > self.policy.total_relative_epsilon {
                flags.push(AuditFlag::TotalMismatch {
                    field: field.to_string(),
                    reported,
                    computed,
                });
            }
        }

        computed
    }

    fn allocate_pool(
        &self,
        pool: RawPooledContribution,
        expenses_total: f64,
        flags: &mut Vec<AuditFlag>,
    ) -> Option<PooledContribution> {
        let method = pool
            .method
            .unwrap_or_else(|| DEFAULT_ALLOCATION_METHOD.to_string());

        match (pool.total_pool_amount, pool.all_documents_expense_total) {
            (Some(total), Some(all_expenses)) if all_expenses > 0.0 => {
                let ratio = expenses_total / all_expenses;
                let allocated = round_cents(total * ratio);

                if let Some(reported) = pool.allocated_amount {
                    if (reported - allocated).abs() > self.policy.allocation_tolerance {
                        flags.push(AuditFlag::PooledAllocationMismatch {
                            reported,
                            computed: allocated,
                        });
                    }
                }

                Some(PooledContribution {
                    total_pool_amount: total,
                    all_documents_expense_total: all_expenses,
                    this_document_ratio: ratio,
                    allocated_amount: allocated,
                    method,
                })
            }
            (total, all_expenses) => {
                if total.is_none() {
                    flags.push(AuditFlag::MissingField {
                        field: "pooled_contribution.total_pool_amount".to_string(),
                    });
                }
                if all_expenses.unwrap_or(0.0) <= 0.0 {
                    flags.push(AuditFlag::MissingField {
                        field: "pooled_contribution.all_documents_expense_total".to_string(),
                    });
                }

                pool.allocated_amount.map(|allocated| PooledContribution {
                    total_pool_amount: total.unwrap_or(0.0),
                    all_documents_expense_total: all_expenses.unwrap_or(0.0),
                    this_document_ratio: pool.this_document_ratio.unwrap_or(0.0),
                    allocated_amount: allocated,
                    method,
                })
            }
        }
    }

    fn reconcile_bank(
        &self,
        bank: RawBankReconciliation,
        flags: &mut Vec<AuditFlag>,
    ) -> BankReconciliation {
        let difference = match (bank.bank_balance, bank.system_balance) {
            (Some(b), Some(s)) => round_cents(b - s),
            _ => bank.difference.unwrap_or(0.0),
        };

        if difference.abs() > self.policy.reconciliation_alert_threshold {
            flags.push(AuditFlag::ReconciliationDivergence { difference });
        }

        BankReconciliation {
            bank_balance: bank.bank_balance.into(),
            system_balance: bank.system_balance.into(),
            difference,
            status: if difference.abs() < 0.005 {
                ReconciliationStatus::Reconciled
            } else {
                ReconciliationStatus::Divergent
            },
        }
    }
}

pub fn validate_extraction(payload: &Value) -> Result<Vec<FinancialStatementExtraction>> {
    RecordValidator::default().validate(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn statement_616() -> Value {
        json!({
            "competency": "09/2025",
            "project_code": "616",
            "project_name": "Extra Contratual - Fiação Enterrada",
            "document_type": "POSITION_STATEMENT",
            "opening_balance": 282995.57,
            "closing_balance": 355854.25,
            "expenses": [
                {"description": "Fiação", "amount": 82.60, "category": "Services", "vendor": "Eletro SP"}
            ],
            "expenses_total": 82.60,
            "revenues": [{"type": "Profitability", "amount": 72941.28}],
            "revenues_total": 72941.28,
            "pooled_contribution": {
                "total_pool_amount": 5483433.37,
                "all_documents_expense_total": 7319162.16,
                "this_document_ratio": 0.00001129,
                "allocated_amount": 61.87,
                "method": "Proportional to monthly expenses"
            },
            "bank_reconciliation": {
                "bank_balance": 355854.25,
                "system_balance": 355854.25,
                "difference": 0.0,
                "status": "reconciled"
            },
            "extraction_quality": "COMPLETE"
        })
    }

    #[test]
    fn test_pooled_allocation_scenario() {
        let records = validate_extraction(&statement_616()).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];

        let pool = record.pooled_contribution.as_ref().unwrap();
        assert!(
            (pool.this_document_ratio - 0.00001129).abs() < 1e-7,
            "ratio was {}",
            pool.this_document_ratio
        );
        assert!(
            (pool.allocated_amount - 61.87).abs() < 0.05,
            "allocated was {}",
            pool.allocated_amount
        );
        assert_eq!(record.balance_check.status, BalanceStatus::Ok);
        assert!(!record.requires_audit());
        assert!(record.audit_flags.is_empty(), "{:?}", record.audit_flags);
        assert_eq!(
            record.bank_reconciliation.as_ref().unwrap().status,
            ReconciliationStatus::Reconciled
        );
    }

    #[test]
    fn test_balance_tolerance_boundary() {
        let validator = RecordValidator::default();
        let opening = Amount::Value(1000.00);

        let (check, flag) =
            validator.check_balance(opening, Amount::Value(1201.00), 300.00, 100.00);
        assert_eq!(check.status, BalanceStatus::Ok);
        assert!(flag.is_none());

        let (check, flag) =
            validator.check_balance(opening, Amount::Value(1198.99), 300.00, 100.00);
        assert_eq!(check.status, BalanceStatus::AuditRequired);
        assert!(matches!(flag, Some(AuditFlag::AuditRequired { .. })));

        let (check, _) = validator.check_balance(opening, Amount::NotInformed, 300.00, 100.00);
        assert_eq!(check.status, BalanceStatus::NotVerifiable);
    }

    #[test]
    fn test_missing_competency_is_fatal() {
        let mut payload = statement_616();
        payload.as_object_mut().unwrap().remove("competency");
        let err = validate_extraction(&payload).unwrap_err();
        assert!(matches!(
            err,
            IngestError::MissingRequiredField {
                field: "competency",
                index: 0
            }
        ));
    }

    #[test]
    fn test_missing_project_code_is_fatal() {
        let mut payload = statement_616();
        payload["project_code"] = json!("not_informed");
        let err = validate_extraction(&json!([payload])).unwrap_err();
        assert!(matches!(
            err,
            IngestError::MissingRequiredField {
                field: "project_code",
                ..
            }
        ));
    }

    #[test]
    fn test_total_mismatch_is_flagged_not_fatal() {
        let mut payload = statement_616();
        payload["expenses_total"] = json!(182.60);
        let record = &validate_extraction(&payload).unwrap()[0];
        assert_eq!(record.expenses_total, 82.60);
        assert!(record.audit_flags.iter().any(|f| matches!(
            f,
            AuditFlag::TotalMismatch { field, .. } if field == "expenses_total"
        )));
        assert!(!record.requires_audit());
    }

    #[test]
    fn test_absent_optional_fields_degrade() {
        let record = &validate_extraction(&json!({
            "competencia": "SET 2025",
            "codigo_obra": "BCO",
            "saldo_inicial": "não_informado",
            "despesas": [{"descricao": "Locação de andaime", "valor": 1500, "categoria": "Locacao"}]
        }))
        .unwrap()[0];

        assert_eq!(record.competency, "09/2025");
        assert_eq!(record.opening_balance, Amount::NotInformed);
        assert_eq!(record.expenses[0].category, ExpenseCategory::Rental);
        assert_eq!(record.balance_check.status, BalanceStatus::NotVerifiable);
        assert_eq!(
            record.extraction_quality,
            ExtractionQuality::PartialMissingFields
        );
        assert!(record
            .audit_flags
            .iter()
            .any(|f| matches!(f, AuditFlag::MissingField { field } if field == "opening_balance")));
    }

    #[test]
    fn test_reconciliation_divergence() {
        let mut payload = statement_616();
        payload["bank_reconciliation"]["bank_balance"] = json!(356000.00);
        let record = &validate_extraction(&payload).unwrap()[0];
        let bank = record.bank_reconciliation.as_ref().unwrap();
        assert_eq!(bank.status, ReconciliationStatus::Divergent);
        assert!(record.requires_audit());
    }

    #[test]
    fn test_multiple_projects_in_one_document() {
        let mut second = statement_616();
        second["project_code"] = json!("562");
        let records = validate_extraction(&json!([statement_616(), second])).unwrap();
        let codes: Vec<&str> = records.iter().map(|r| r.project_code.as_str()).collect();
        assert_eq!(codes, vec!["616", "562"]);
    }

    #[test]
    fn test_empty_array_is_rejected() {
        let err = validate_extraction(&json!([])).unwrap_err();
        assert_eq!(err.kind(), "unparsable_model_output");
    }

    #[test]
    fn test_unrecognized_revenue_type_maps_to_other() {
        let mut payload = statement_616();
        payload["revenues"] = json!([
            {"type": "Profitability", "amount": 72000.00},
            {"type": "Reembolso", "amount": 941.28}
        ]);
        let record = &validate_extraction(&payload).unwrap()[0];
        assert_eq!(record.revenues[1].movement_type, MovementType::Other);
        assert_eq!(record.revenues_total, 72941.28);
        assert_eq!(record.balance_check.status, BalanceStatus::Ok);
    }
}
