pub mod feedback;
pub mod learning;

pub use feedback::FeedbackService;
pub use learning::LearningService;
