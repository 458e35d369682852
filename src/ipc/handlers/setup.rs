use crate::ipc::error::{err, ok};
use crate::ipc::handlers::db_conn;
use crate::ipc::types::{AppState, Request};
use crate::scoring;
use serde_json::json;

// Display defaults seeded into grade_scales. These mirror the
// hardcoded scoring policy but only the color_code is ever read back
// (chart coloring); the points column is configuration dead weight
// kept for operator visibility.
const DEFAULT_SCALES: [(&str, i64); 6] = [
    ("Superb", 20),
    ("Good", 15),
    ("Average", 0),
    ("Poor", -10),
    ("Fail", -15),
    ("Horrible", -20),
];

fn handle_seed_grade_scales(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    for (grade_name, points) in DEFAULT_SCALES {
        let res = conn.execute(
            "INSERT INTO grade_scales(grade_name, color_code, points)
             VALUES (?, ?, ?)
             ON CONFLICT(grade_name) DO UPDATE SET color_code = excluded.color_code,
                                                   points = excluded.points",
            (grade_name, scoring::grade_color(grade_name), points),
        );
        if let Err(e) = res {
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
    }
    ok(&req.id, json!({ "seeded": DEFAULT_SCALES.len() }))
}

fn handle_list_grade_scales(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let mut stmt = match conn
        .prepare("SELECT grade_name, color_code, points FROM grade_scales ORDER BY grade_name")
    {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "gradeName": r.get::<_, String>(0)?,
                "colorCode": r.get::<_, String>(1)?,
                "points": r.get::<_, i64>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(scales) => ok(&req.id, json!({ "gradeScales": scales })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.gradeScales" => Some(handle_seed_grade_scales(state, req)),
        "gradeScales.list" => Some(handle_list_grade_scales(state, req)),
        _ => None,
    }
}
