use serde::{Deserialize, Serialize};

pub type TaskId = String;
pub type GroupKey = String;

/// Largo máximo de una clave de grupo enviada por el cliente.
pub const MAX_GROUP_KEY_LEN: usize = 14;

/// Una tarea de traducción tal como vive en la cola del coordinador.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Grupos a los que pertenece la tarea (sin repetidos, en orden de llegada)
    #[serde(default)]
    pub group: Vec<GroupKey>,
    /// Clave del archivo fuente en el storage privado
    pub file: String,
    pub target_language: String,
    pub detector: String,
    pub direction: String,
    pub translator: String,
    pub size: String,
}

impl Task {
    pub fn in_any_group(&self, groups: &[GroupKey]) -> bool {
        groups.iter().any(|g| self.group.contains(g))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupKey>,
    pub file: String,
    pub target_language: String,
    pub detector: String,
    pub direction: String,
    pub translator: String,
    pub size: String,
}

impl From<SubmitRequest> for Task {
    fn from(req: SubmitRequest) -> Self {
        Task {
            id: req.id,
            group: req.group.into_iter().collect(),
            file: req.file,
            target_language: req.target_language,
            detector: req.detector,
            direction: req.direction,
            translator: req.translator,
            size: req.size,
        }
    }
}

/// Respuesta a un submit: `{id, pos}` o `{id: null, error}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubmitResponse {
    Accepted { id: TaskId, pos: usize },
    Rejected { id: Option<TaskId>, error: String },
}

impl SubmitResponse {
    pub fn rejected(error: impl Into<String>) -> Self {
        SubmitResponse::Rejected {
            id: None,
            error: error.into(),
        }
    }
}

/// Estado persistido en la base relacional (mismos códigos que la tabla `task`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Error,
}

impl TaskState {
    pub fn code(self) -> i16 {
        match self {
            TaskState::Pending => 1,
            TaskState::Running => 2,
            TaskState::Done => 3,
            TaskState::Error => 4,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(TaskState::Pending),
            2 => Some(TaskState::Running),
            3 => Some(TaskState::Done),
            4 => Some(TaskState::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Done => write!(f, "done"),
            TaskState::Error => write!(f, "error"),
        }
    }
}

/// Une dos listas de grupos conservando el orden de `a` y agregando
/// al final los de `b` que falten.
pub fn merge_groups(a: &[GroupKey], b: &[GroupKey]) -> Vec<GroupKey> {
    let mut merged = a.to_vec();
    for g in b {
        if !merged.contains(g) {
            merged.push(g.clone());
        }
    }
    merged
}

/// Clave de la máscara de traducción para una tarea (determinística).
pub fn translation_mask_key(id: &str) -> String {
    format!("mask/{}.png", id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups(v: &[&str]) -> Vec<GroupKey> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn merge_keeps_order_and_drops_duplicates() {
        let merged = merge_groups(&groups(&["a", "b"]), &groups(&["b", "c", "a", "d"]));
        assert_eq!(merged, groups(&["a", "b", "c", "d"]));
    }

    #[test]
    fn merge_with_empty_sides() {
        assert_eq!(merge_groups(&[], &groups(&["x"])), groups(&["x"]));
        assert_eq!(merge_groups(&groups(&["x"]), &[]), groups(&["x"]));
    }

    #[test]
    fn submit_request_without_group_has_no_groups() {
        let req: SubmitRequest = serde_json::from_str(
            r#"{"id":"t1","file":"f.png","target_language":"ENG","detector":"default",
                "direction":"auto","translator":"deepl","size":"M"}"#,
        )
        .unwrap();
        let task = Task::from(req);
        assert!(task.group.is_empty());
        assert_eq!(task.file, "f.png");
    }

    #[test]
    fn submit_response_shapes() {
        let ok = serde_json::to_value(SubmitResponse::Accepted {
            id: "t1".into(),
            pos: 3,
        })
        .unwrap();
        assert_eq!(ok, serde_json::json!({"id": "t1", "pos": 3}));

        let err = serde_json::to_value(SubmitResponse::rejected("queue-full")).unwrap();
        assert_eq!(err, serde_json::json!({"id": null, "error": "queue-full"}));
    }

    #[test]
    fn mask_key_is_derived_from_id() {
        assert_eq!(translation_mask_key("abc"), "mask/abc.png");
    }

    #[test]
    fn task_state_codes_round_trip() {
        for s in [
            TaskState::Pending,
            TaskState::Running,
            TaskState::Done,
            TaskState::Error,
        ] {
            assert_eq!(TaskState::from_code(s.code()), Some(s));
        }
        assert_eq!(TaskState::from_code(9), None);
    }
}
