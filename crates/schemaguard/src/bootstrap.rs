//! Privileged procedures installed once on every tenant database.
//!
//! All three run as `SECURITY DEFINER` with a pinned `search_path`, are
//! revoked from `PUBLIC` and granted to a single service role. The
//! statement rules in `schema_execute_statements_v1` are the ones
//! mirrored by [`schemaguard_core::guard`].

use schemaguard_core::expectation::quote_ident;

/// Returns the live schema as JSON.
pub const INTROSPECTION_PROCEDURE: &str = "schema_introspection_v1";

/// Runs read-only SELECTs and returns per-query results.
pub const RUN_SELECTS_PROCEDURE: &str = "schema_run_selects_v1";

/// Runs gated DDL and returns per-statement results.
pub const EXECUTE_STATEMENTS_PROCEDURE: &str = "schema_execute_statements_v1";

const INTROSPECTION_SQL: &str = r"
CREATE OR REPLACE FUNCTION public.schema_introspection_v1()
RETURNS jsonb
LANGUAGE sql
STABLE
SECURITY DEFINER
SET search_path = pg_catalog, public
AS $fn$
SELECT jsonb_build_object(
    'tables', COALESCE((
        SELECT jsonb_agg(jsonb_build_object(
            'name', c.relname,
            'rls_enabled', c.relrowsecurity,
            'columns', COALESCE((
                SELECT jsonb_agg(jsonb_build_object(
                    'name', a.attname,
                    'data_type', format_type(a.atttypid, a.atttypmod),
                    'nullable', NOT a.attnotnull,
                    'default', pg_get_expr(d.adbin, d.adrelid)
                ) ORDER BY a.attnum)
                FROM pg_attribute a
                LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
                WHERE a.attrelid = c.oid AND a.attnum > 0 AND NOT a.attisdropped
            ), '[]'::jsonb)
        ) ORDER BY c.relname)
        FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = 'public' AND c.relkind IN ('r', 'p')
    ), '[]'::jsonb),
    'indexes', COALESCE((
        SELECT jsonb_agg(jsonb_build_object(
            'name', i.relname,
            'table', t.relname,
            'unique', x.indisunique,
            'definition', pg_get_indexdef(x.indexrelid)
        ) ORDER BY i.relname)
        FROM pg_index x
        JOIN pg_class i ON i.oid = x.indexrelid
        JOIN pg_class t ON t.oid = x.indrelid
        JOIN pg_namespace n ON n.oid = t.relnamespace
        WHERE n.nspname = 'public'
    ), '[]'::jsonb),
    'constraints', COALESCE((
        SELECT jsonb_agg(jsonb_build_object(
            'name', k.conname,
            'table', t.relname,
            'kind', k.contype::text,
            'definition', pg_get_constraintdef(k.oid)
        ) ORDER BY t.relname, k.conname)
        FROM pg_constraint k
        JOIN pg_class t ON t.oid = k.conrelid
        JOIN pg_namespace n ON n.oid = t.relnamespace
        WHERE n.nspname = 'public'
    ), '[]'::jsonb),
    'policies', COALESCE((
        SELECT jsonb_agg(jsonb_build_object(
            'name', p.policyname,
            'table', p.tablename,
            'command', p.cmd,
            'roles', to_jsonb(p.roles::text[]),
            'permissive', p.permissive
        ) ORDER BY p.tablename, p.policyname)
        FROM pg_policies p
        WHERE p.schemaname = 'public'
    ), '[]'::jsonb),
    'views', COALESCE((
        SELECT jsonb_agg(jsonb_build_object(
            'name', v.viewname,
            'definition', v.definition
        ) ORDER BY v.viewname)
        FROM pg_views v
        WHERE v.schemaname = 'public'
    ), '[]'::jsonb),
    'extensions', COALESCE((
        SELECT jsonb_agg(jsonb_build_object(
            'name', e.extname,
            'version', e.extversion
        ) ORDER BY e.extname)
        FROM pg_extension e
    ), '[]'::jsonb)
);
$fn$;
";

const RUN_SELECTS_SQL: &str = r"
CREATE OR REPLACE FUNCTION public.schema_run_selects_v1(queries text[])
RETURNS jsonb
LANGUAGE plpgsql
SECURITY DEFINER
SET search_path = pg_catalog, public
AS $fn$
DECLARE
    q text;
    v_rows jsonb;
    v_results jsonb := '[]'::jsonb;
    v_state text;
    v_message text;
    v_detail text;
    v_hint text;
BEGIN
    FOREACH q IN ARRAY COALESCE(queries, ARRAY[]::text[]) LOOP
        IF q !~* '^\s*select\M' OR position(';' IN q) > 0 THEN
            v_results := v_results || jsonb_build_array(jsonb_build_object(
                'query', q, 'ok', false, 'rows', '[]'::jsonb,
                'error', jsonb_build_object(
                    'message', 'preflight queries must be a single SELECT without '';''',
                    'code', '42501', 'detail', NULL, 'hint', NULL)));
            CONTINUE;
        END IF;
        BEGIN
            EXECUTE format('SELECT COALESCE(jsonb_agg(to_jsonb(r)), ''[]''::jsonb) FROM (%s) r', q)
                INTO v_rows;
            v_results := v_results || jsonb_build_array(jsonb_build_object(
                'query', q, 'ok', true, 'rows', v_rows, 'error', NULL));
        EXCEPTION WHEN OTHERS THEN
            GET STACKED DIAGNOSTICS
                v_state = RETURNED_SQLSTATE,
                v_message = MESSAGE_TEXT,
                v_detail = PG_EXCEPTION_DETAIL,
                v_hint = PG_EXCEPTION_HINT;
            v_results := v_results || jsonb_build_array(jsonb_build_object(
                'query', q, 'ok', false, 'rows', '[]'::jsonb,
                'error', jsonb_build_object(
                    'message', v_message, 'code', v_state,
                    'detail', NULLIF(v_detail, ''), 'hint', NULLIF(v_hint, ''))));
        END;
    END LOOP;
    RETURN v_results;
END;
$fn$;
";

const EXECUTE_STATEMENTS_SQL: &str = r"
CREATE OR REPLACE FUNCTION public.schema_execute_statements_v1(
    statements text[],
    allow_destructive boolean DEFAULT false,
    confirmation_phrase text DEFAULT NULL
)
RETURNS jsonb
LANGUAGE plpgsql
SECURITY DEFINER
SET search_path = pg_catalog, public
AS $fn$
DECLARE
    s text;
    v_reject text;
    v_results jsonb := '[]'::jsonb;
    v_state text;
    v_message text;
    v_detail text;
    v_hint text;
BEGIN
    IF COALESCE(allow_destructive, false)
        AND confirmation_phrase IS DISTINCT FROM 'ALLOW DESTRUCTIVE CHANGES' THEN
        RAISE EXCEPTION 'destructive execution requires the exact confirmation phrase'
            USING ERRCODE = '22023',
                  HINT = 'Pass confirmation_phrase => ''ALLOW DESTRUCTIVE CHANGES''.';
    END IF;

    FOREACH s IN ARRAY COALESCE(statements, ARRAY[]::text[]) LOOP
        v_reject := NULL;
        IF NOT COALESCE(allow_destructive, false) THEN
            IF NOT (
                s ~* '^\s*create\s+table\s+if\s+not\s+exists\M'
                OR s ~* '^\s*alter\s+table\M.*\madd\s+column\s+if\s+not\s+exists\M'
                OR s ~* '^\s*create\s+(unique\s+)?index\s+(concurrently\s+)?if\s+not\s+exists\M'
                OR s ~* '^\s*alter\s+table\M.*\menable\s+row\s+level\s+security\M'
                OR s ~* '^\s*create\s+policy\M'
                OR s ~* '^\s*alter\s+table\M.*\madd\s+constraint\M'
                OR s ~* '^\s*create\s+extension\s+if\s+not\s+exists\M'
                OR s ~* '^\s*create\s+or\s+replace\s+view\M'
            ) THEN
                v_reject := 'statement is not on the safe-mode allow-list';
            ELSIF s ~* '\mdrop\M' THEN
                v_reject := 'statement contains forbidden keyword DROP in safe mode';
            ELSIF s ~* '\mrename\M' THEN
                v_reject := 'statement contains forbidden keyword RENAME in safe mode';
            ELSIF s ~* '\malter\s+column\M.*\mtype\M' THEN
                v_reject := 'statement contains forbidden keyword ALTER COLUMN ... TYPE in safe mode';
            END IF;
        END IF;

        IF v_reject IS NOT NULL THEN
            v_results := v_results || jsonb_build_array(jsonb_build_object(
                'statement', s, 'ok', false,
                'error', jsonb_build_object(
                    'message', v_reject, 'code', '42501', 'detail', NULL, 'hint', NULL)));
            CONTINUE;
        END IF;

        BEGIN
            EXECUTE s;
            v_results := v_results || jsonb_build_array(jsonb_build_object(
                'statement', s, 'ok', true, 'error', NULL));
        EXCEPTION WHEN OTHERS THEN
            GET STACKED DIAGNOSTICS
                v_state = RETURNED_SQLSTATE,
                v_message = MESSAGE_TEXT,
                v_detail = PG_EXCEPTION_DETAIL,
                v_hint = PG_EXCEPTION_HINT;
            v_results := v_results || jsonb_build_array(jsonb_build_object(
                'statement', s, 'ok', false,
                'error', jsonb_build_object(
                    'message', v_message, 'code', v_state,
                    'detail', NULLIF(v_detail, ''), 'hint', NULLIF(v_hint, ''))));
        END;
    END LOOP;
    RETURN v_results;
END;
$fn$;
";

/// Function signatures, as used in `REVOKE`/`GRANT`.
const SIGNATURES: [&str; 3] = [
    "public.schema_introspection_v1()",
    "public.schema_run_selects_v1(text[])",
    "public.schema_execute_statements_v1(text[], boolean, text)",
];

/// Renders the SQL that installs the procedures and grants them to `role`.
#[must_use]
pub fn bootstrap_sql(role: &str) -> String {
    let mut sql = String::from("-- schemaguard bootstrap: run once per tenant database as its owner.\n");
    sql.push_str(INTROSPECTION_SQL);
    sql.push_str(RUN_SELECTS_SQL);
    sql.push_str(EXECUTE_STATEMENTS_SQL);
    sql.push('\n');
    let role = quote_ident(role);
    for signature in SIGNATURES {
        sql.push_str(&format!("REVOKE ALL ON FUNCTION {signature} FROM PUBLIC;\n"));
        sql.push_str(&format!("GRANT EXECUTE ON FUNCTION {signature} TO {role};\n"));
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_defines_all_procedures() {
        let sql = bootstrap_sql("service_role");
        for name in [
            INTROSPECTION_PROCEDURE,
            RUN_SELECTS_PROCEDURE,
            EXECUTE_STATEMENTS_PROCEDURE,
        ] {
            assert!(
                sql.contains(&format!("CREATE OR REPLACE FUNCTION public.{name}(")),
                "{name}"
            );
        }
        assert_eq!(sql.matches("SECURITY DEFINER").count(), 3);
        assert_eq!(sql.matches("SET search_path = pg_catalog, public").count(), 3);
    }

    #[test]
    fn test_bootstrap_grants_only_to_role() {
        let sql = bootstrap_sql("tenant_admin");
        assert_eq!(sql.matches("FROM PUBLIC;").count(), 3);
        assert!(sql.contains(
            "GRANT EXECUTE ON FUNCTION public.schema_introspection_v1() TO \"tenant_admin\";"
        ));
    }

    #[test]
    fn test_bootstrap_quotes_role() {
        let sql = bootstrap_sql("odd\"role");
        assert!(sql.contains("TO \"odd\"\"role\";"));
    }

    #[test]
    fn test_server_phrase_matches_client_phrase() {
        assert!(EXECUTE_STATEMENTS_SQL.contains(&format!(
            "IS DISTINCT FROM '{}'",
            schemaguard_core::guard::DESTRUCTIVE_CONFIRMATION_PHRASE
        )));
    }
}
