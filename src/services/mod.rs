pub(crate) mod ai_grading;
pub(crate) mod answer_grading;
pub(crate) mod auto_submit;
pub(crate) mod errors;
pub(crate) mod exam_window;
pub(crate) mod grading;
pub(crate) mod lobby;
pub(crate) mod question_bank;
pub(crate) mod variant_assignment;
