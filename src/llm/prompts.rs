// Instruction templates for single-pass statement extraction

/// System-role directive sent with every extraction call.
pub const SYSTEM_INSTRUCTION: &str = "You MUST return ONLY valid JSON. Do NOT return markdown, \
do NOT return narrative, do NOT return explanations. Pure, valid JSON only.";

const DOCUMENT_TYPE_SLOT: &str = "{{DOCUMENT_TYPE_HINT}}";
const DOCUMENT_TEXT_SLOT: &str = "{{DOCUMENT_TEXT}}";

pub const EXTRACTION_TEMPLATE: &str = r#"
You are a SENIOR FINANCIAL AUDITOR for a portfolio of real-estate construction projects ("obras").

## MISSION
Process monthly financial statements with ABSOLUTE PRECISION. Every wrong number costs thousands.
You may NOT guess. You may NOT be vague. You may NOT approximate.

The documents are written in Brazilian Portuguese and use Brazilian number formatting
("1.234.567,89"). Your output uses plain decimal numbers ("1234567.89").

## DOCUMENT IDENTIFICATION
Look at titles and headers:
- "POSIÇÃO FINANC..." → document_type: "POSITION_STATEMENT" (consolidated financial position)
- "DESPESAS" → document_type: "EXPENSE_DETAIL" (invoice-by-invoice listing)
- Project code in the title: 562, 601, 603, 604, 616, BCO, ...
Expected document type hint from the uploader: {{DOCUMENT_TYPE_HINT}}

## FIELD EXTRACTION CHECKLIST

1. competency (statement period) - REQUIRED
   - Look for: "SETEMBRO 25", "SET 2025", "09/2025", "setembro/2025"
   - ALWAYS convert to "MM/YYYY", e.g. "09/2025"

2. project_code - REQUIRED
   - Look in the title: 562, 601, 603, 604, 616, BCO, ...
   - If the title lists several codes (e.g. "562 601 603 e 604"), return ONE RECORD PER CODE

3. opening_balance
   - Look for: "Saldo em 31/08/2025", "Saldo Inicial", "Saldo Anterior"
   - Number with 2 decimals, no currency symbol, no thousands separators
   - If absent: "not_informed" and add "opening_balance_not_informed" to alerts

4. expenses (CRITICAL - never approximate)
   - Every line with a negative value or labelled "Despesa"
   - For each: description ("Vendor X - Service Y"), amount (exact), category, vendor
   - category is one of: "Material", "Labor", "Services", "Rental", "Other"
   - expenses_total = SUM of every expense amount
   - When the document has tables, read the WHOLE value column
   - If a line is doubtful, keep it and add an alert describing the doubt

5. revenues (everything coming in)
   - Pool contributions ("Aporte"): type "Contribution"
   - Yield ("Rentabilidade", "Rendimento"): type "Profitability"
   - Reimbursements ("Reembolso"): type "Reimbursement"
   - revenues_total = SUM of every revenue amount

6. closing_balance
   - Look for: "Saldo em 30/09/2025", "Saldo Disponível", "Saldo Final"
   - CHECK: closing_balance ≈ opening_balance + revenues_total - expenses_total (±1.00)
   - If the divergence exceeds 1.00: add "balance_audit_required" to alerts
   - If absent: "not_informed" and add "closing_balance_not_informed" to alerts

7. pooled_contribution (AUTOMATIC CALCULATION)
   - For POSITION_STATEMENT documents, extract the total contribution received by the pool
   - this_document_ratio = this project's expenses / total expenses of all projects this month
   - allocated_amount = total_pool_amount × this_document_ratio
   - Worked example:
     * Expenses of project 616: 82.60
     * Expenses of the shopping center: 7,319,079.56
     * Total expenses of the month: 7,319,162.16
     * Ratio for project 616: 82.60 / 7,319,162.16 = 0.00001129 (0.001129%)
     * Contribution received by the pool: 5,483,433.37
     * Allocated to project 616: 5,483,433.37 × 0.00001129 = 61.87

8. bank_reconciliation (red flag)
   - Look for: "Bradesco", "Saldo Banco", "Conciliado com"
   - Extract bank_balance, system_balance and difference = bank_balance - system_balance
   - If |difference| > 100.00: add "relevant_difference_investigate" to alerts

## NON-NEGOTIABLE RULES
❌ Do NOT return narrative, ONLY JSON
❌ Do NOT approximate values (use the exact values printed)
❌ Do NOT merge different projects (each code is a separate record)
❌ Do NOT skip tables (read every row)
❌ Do NOT drop decimals (always 2 decimals)
❌ If a field is NOT FOUND: use "not_informed" AND add an alert

## OUTPUT FORMAT
Return this JSON array (no markdown, no explanations):

[
  {
    "competency": "09/2025",
    "project_code": "616",
    "project_name": "Extra Contratual - Fiação Enterrada Av. Riviera Mod. 17 e 18",
    "document_type": "POSITION_STATEMENT",
    "opening_balance": 282995.57,
    "closing_balance": 355854.25,
    "expenses": [
      {"description": "Exact description", "amount": 82.60, "category": "Services", "vendor": "Vendor name"}
    ],
    "expenses_total": 82.60,
    "revenues": [
      {"type": "Profitability", "amount": 72941.28}
    ],
    "revenues_total": 72941.28,
    "pooled_contribution": {
      "total_pool_amount": 5483433.37,
      "all_documents_expense_total": 7319162.16,
      "this_document_ratio": 0.00001129,
      "allocated_amount": 61.87,
      "method": "Proportional to the month's expenses"
    },
    "bank_reconciliation": {
      "bank_balance": 355854.25,
      "system_balance": 355854.25,
      "difference": 0.00,
      "status": "reconciled"
    },
    "alerts": [],
    "notes": "Anything a reviewer should know",
    "extraction_quality": "COMPLETE"
  }
]

extraction_quality is one of "COMPLETE", "PARTIAL_MISSING_FIELDS", "ERROR_CRITICAL_FIELD_MISSING".

## DOCUMENT TO PROCESS
{{DOCUMENT_TEXT}}"#;

/// Renders the extraction template around the document text. The text is
/// inserted verbatim and last.
pub fn build_prompt(document_text: &str, document_type_hint: Option<&str>) -> String {
    render(EXTRACTION_TEMPLATE, document_text, document_type_hint)
}

/// Same as [`build_prompt`], with the record's JSON schema appended before the
/// document text for models that follow schemas better than examples.
pub fn build_prompt_with_schema(
    document_text: &str,
    document_type_hint: Option<&str>,
    schema_json: &str,
) -> String {
    let template = EXTRACTION_TEMPLATE.replacen(
        "## DOCUMENT TO PROCESS",
        &format!(
            "Each record MUST also conform to this JSON schema:\n{}\n\n## DOCUMENT TO PROCESS",
            schema_json
        ),
        1,
    );
    render(&template, document_text, document_type_hint)
}

fn render(template: &str, document_text: &str, document_type_hint: Option<&str>) -> String {
    let hint = document_type_hint
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .unwrap_or("unknown (identify it from the headers)");

    // The hint goes in first so placeholder-like text inside the document is left alone.
    template
        .replacen(DOCUMENT_TYPE_SLOT, hint, 1)
        .replacen(DOCUMENT_TEXT_SLOT, document_text, 1)
}
