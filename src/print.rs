//! Plain-text printout of one OT day.

use std::collections::HashMap;

use crate::model::{Comment, OperatingRoom, OtDay, Procedure};

const UNASSIGNED: &str = "Unassigned";

fn patient_line(procedure: &Procedure, day: &OtDay) -> String {
    let Some(patient) = procedure.patient_snapshot() else {
        return format!("(patient {})", procedure.patient);
    };
    let mut line = if patient.name.is_empty() { "(no name)".to_string() } else { patient.name.clone() };
    if !patient.hospital_id.is_empty() {
        line.push_str(&format!(" [{}]", patient.hospital_id));
    }
    let age = day.date.and_then(|date| patient.age_on(date));
    match (age, patient.sex.is_empty()) {
        (Some(age), false) => line.push_str(&format!(" {}y/{}", age, patient.sex)),
        (Some(age), true) => line.push_str(&format!(" {}y", age)),
        (None, false) => line.push_str(&format!(" {}", patient.sex)),
        (None, true) => {}
    }
    line
}

fn detail(lines: &mut Vec<String>, label: &str, value: &str) {
    if !value.is_empty() {
        lines.push(format!("   {}: {}", label, value));
    }
}

fn entry(lines: &mut Vec<String>, procedure: &Procedure, day: &OtDay, comments: &[&Comment]) {
    lines.push(format!("{}. {}", procedure.order, patient_line(procedure, day)));
    detail(lines, "Diagnosis", &procedure.diagnosis);
    detail(lines, "Procedure", &procedure.procedure);
    detail(lines, "Comorbidities", &procedure.comorbidities);
    detail(lines, "Anesthesia", &procedure.anesthesia);
    detail(lines, "Duration", &procedure.duration);
    detail(lines, "Bed", &procedure.bed);
    detail(lines, "Requirements", &procedure.special_requirements);
    detail(lines, "Remarks", &procedure.remarks);
    for comment in comments {
        lines.push(format!("   # {}", comment.text));
    }
}

/// Render the day's list: rooms in position order, each with its live
/// procedures in list order, then removed procedures for the record.
pub fn render_day(day: &OtDay, rooms: &[OperatingRoom], procedures: &[Procedure], comments: &[Comment]) -> String {
    let mut by_procedure: HashMap<&str, Vec<&Comment>> = HashMap::new();
    for comment in comments {
        by_procedure.entry(comment.procedure.as_str()).or_default().push(comment);
    }
    for thread in by_procedure.values_mut() {
        thread.sort_by_key(|comment| comment.created);
    }
    let comments_for = |procedure: &Procedure| by_procedure.get(procedure.id.as_str()).cloned().unwrap_or_default();

    let mut lines = Vec::new();
    let date = day.date.map_or_else(|| "(no date)".to_string(), |date| date.format("%Y-%m-%d").to_string());
    lines.push(format!("OT list for {}", date));
    if day.disabled {
        let reason = if day.remarks.is_empty() { "no reason given" } else { day.remarks.as_str() };
        lines.push(format!("DISABLED: {}", reason));
    }

    let mut rooms: Vec<&OperatingRoom> = rooms.iter().collect();
    rooms.sort_by_key(|room| room.position);

    let live = |room: &str| {
        let mut list: Vec<&Procedure> = procedures
            .iter()
            .filter(|procedure| !procedure.removed && procedure.operating_room == room)
            .collect();
        list.sort_by_key(|procedure| procedure.order);
        list
    };

    for room in &rooms {
        lines.push(String::new());
        lines.push(format!("== {} ==", room.name));
        let list = live(&room.id);
        if list.is_empty() {
            lines.push("   (no procedures)".to_string());
        }
        for procedure in list {
            entry(&mut lines, procedure, day, &comments_for(procedure));
        }
    }

    let mut stray: Vec<&Procedure> = procedures
        .iter()
        .filter(|procedure| !procedure.removed && !rooms.iter().any(|room| room.id == procedure.operating_room))
        .collect();
    if !stray.is_empty() {
        stray.sort_by(|a, b| (&a.operating_room, a.order).cmp(&(&b.operating_room, b.order)));
        lines.push(String::new());
        lines.push(format!("== {} ==", UNASSIGNED));
        for procedure in stray {
            entry(&mut lines, procedure, day, &comments_for(procedure));
        }
    }

    let room_name = |id: &str| {
        rooms
            .iter()
            .find(|room| room.id == id)
            .map_or(UNASSIGNED, |room| room.name.as_str())
    };
    let mut removed: Vec<&Procedure> = procedures.iter().filter(|procedure| procedure.removed).collect();
    if !removed.is_empty() {
        removed.sort_by_key(|procedure| procedure.added_date);
        lines.push(String::new());
        lines.push("== Removed ==".to_string());
        for procedure in removed {
            lines.push(format!(
                "- {}: {} ({})",
                patient_line(procedure, day),
                procedure.procedure,
                room_name(&procedure.operating_room)
            ));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Patient, ProcedureExpand};
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn procedure(id: &str, room: &str, order: u32, name: &str) -> Procedure {
        Procedure {
            id: id.into(),
            operating_room: room.into(),
            order,
            procedure: format!("Case {}", id),
            expand: Some(ProcedureExpand {
                patient: Some(Patient {
                    name: name.into(),
                    sex: "F".into(),
                    date_of_birth: NaiveDate::from_ymd_opt(1990, 1, 1),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        }
    }

    fn day() -> OtDay {
        OtDay { id: "d1".into(), date: NaiveDate::from_ymd_opt(2024, 3, 1), ..Default::default() }
    }

    fn rooms() -> Vec<OperatingRoom> {
        vec![
            OperatingRoom { id: "r2".into(), name: "Theatre 2".into(), position: 2, ..Default::default() },
            OperatingRoom { id: "r1".into(), name: "Theatre 1".into(), position: 1, ..Default::default() },
        ]
    }

    #[test]
    fn groups_by_room_in_position_order() {
        let procedures = vec![
            procedure("p2", "r1", 2, "Bea"),
            procedure("p3", "r2", 1, "Cal"),
            procedure("p1", "r1", 1, "Ann"),
        ];
        let comments = vec![Comment {
            id: "c1".into(),
            procedure: "p1".into(),
            text: "Latex allergy".into(),
            ..Default::default()
        }];

        let text = render_day(&day(), &rooms(), &procedures, &comments);
        let expected = "\
OT list for 2024-03-01

== Theatre 1 ==
1. Ann 34y/F
   Procedure: Case p1
   # Latex allergy
2. Bea 34y/F
   Procedure: Case p2

== Theatre 2 ==
1. Cal 34y/F
   Procedure: Case p3
";
        assert_eq!(text, expected);
    }

    #[test]
    fn removed_and_disabled_are_reported() {
        let mut removed = procedure("p9", "r1", 2, "Dee");
        removed.removed = true;
        let procedures = vec![procedure("p1", "r1", 1, "Ann"), removed];
        let day = OtDay { disabled: true, remarks: "Power outage".into(), ..day() };

        let text = render_day(&day, &rooms(), &procedures, &[]);
        assert!(text.contains("DISABLED: Power outage"));
        assert!(text.contains("== Theatre 2 ==\n   (no procedures)"));
        assert!(text.ends_with("== Removed ==\n- Dee 34y/F: Case p9 (Theatre 1)\n"));
    }
}
