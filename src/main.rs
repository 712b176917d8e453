mod exam;

use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use exam::engine::{AnswerOutcome, ExamEngine, Prompt, QuestionView, ReviewReport};
use exam::error::ExamError;
use exam::ExamResult;
use teloxide::{
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup, ParseMode},
    utils::command::BotCommands,
};

type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "These commands are supported:")]
enum Command {
    #[command(description = "main menu and welcome")]
    Start,
    #[command(description = "help and support")]
    Help,
    #[command(description = "your profile and statistics")]
    Profile,
    #[command(description = "your exam results")]
    Results,
    #[command(description = "reset your exam session")]
    Clear,
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    pretty_env_logger::init();
    log::info!("Starting exam bot...");

    let bot = Bot::from_env();

    let data_dir = std::env::var("EXAM_DATA_DIR").unwrap_or_else(|_| "data".to_string());
    log::info!("Using exam data directory '{}'", data_dir);
    let engine = Arc::new(ExamEngine::open(data_dir));

    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        log::warn!("Failed to set bot commands: {}", e);
    }

    let reminder_bot = bot.clone();
    let reminder_engine = engine.clone();
    tokio::spawn(async move {
        reminder_loop(reminder_bot, reminder_engine).await;
    });

    Dispatcher::builder(
        bot,
        dptree::entry()
            .branch(
                Update::filter_message()
                    .filter_command::<Command>()
                    .endpoint(handle_command),
            )
            .branch(Update::filter_callback_query().endpoint(handle_callback)),
    )
    .dependencies(dptree::deps![engine])
    .enable_ctrlc_handler()
    .build()
    .dispatch()
    .await;
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    engine: Arc<ExamEngine>,
) -> HandlerResult {
    let user = match msg.from() {
        Some(user) => user,
        None => return Ok(()),
    };
    let user_id = user.id.0;

    let (text, keyboard) = match cmd {
        Command::Start => (welcome_text(&user.first_name), main_menu_keyboard()),
        Command::Help => (help_text(), back_to_menu_keyboard()),
        Command::Profile => profile_view(&engine, user_id),
        Command::Results => results_view(&engine, user_id),
        Command::Clear => {
            engine.reset(user_id)?;
            log::info!("Cleared session for user {}", user_id);
            (
                "🧹 Your exam session has been reset.".to_string(),
                main_menu_keyboard(),
            )
        }
    };

    bot.send_message(msg.chat.id, text)
        .parse_mode(ParseMode::Html)
        .reply_markup(keyboard)
        .await?;
    Ok(())
}

async fn handle_callback(bot: Bot, q: CallbackQuery, engine: Arc<ExamEngine>) -> HandlerResult {
    bot.answer_callback_query(q.id.clone()).await?;

    let data = match q.data.as_deref() {
        Some(data) => data,
        None => return Ok(()),
    };
    let user_id = q.from.id.0;
    log::debug!("Callback '{}' from user {}", data, user_id);

    let (text, keyboard) = if data == "main_menu" {
        (welcome_text(&q.from.first_name), main_menu_keyboard())
    } else if data == "take_exam" {
        grades_view(&engine)
    } else if data == "help" {
        (help_text(), back_to_menu_keyboard())
    } else if data == "profile" {
        profile_view(&engine, user_id)
    } else if data == "view_results" {
        results_view(&engine, user_id)
    } else if let Some(grade_id) = data.strip_prefix("grade_") {
        subjects_view(&engine, grade_id)
    } else if let Some(payload) = data.strip_prefix("exam_") {
        match split_exam_payload(payload) {
            Some((grade_id, subject_id)) => overview_view(&engine, grade_id, subject_id),
            None => invalid_selection_view(data),
        }
    } else if let Some(payload) = data.strip_prefix("begin_") {
        match split_exam_payload(payload) {
            Some((grade_id, subject_id)) => match engine.begin(user_id, grade_id, subject_id) {
                Ok(_) => question_or_result(&engine, user_id, "completed")?,
                Err(e) => error_view(e),
            },
            None => invalid_selection_view(data),
        }
    } else if let Some(raw_index) = data.strip_prefix("answer_") {
        match raw_index.parse::<usize>() {
            Ok(option_index) => match engine.submit_answer(user_id, option_index) {
                Ok(AnswerOutcome::NextQuestion) => {
                    question_or_result(&engine, user_id, "completed")?
                }
                Ok(AnswerOutcome::Finished) => result_view(engine.end(user_id)?, "completed"),
                Err(e @ ExamError::OutOfRange { .. }) => {
                    // invalid option, stay on the current question
                    log::warn!("User {} sent an invalid answer: {}", user_id, e);
                    question_or_result(&engine, user_id, "completed")?
                }
                Err(e) => error_view(e),
            },
            Err(_) => invalid_selection_view(data),
        }
    } else if data == "end_exam" {
        match engine.end(user_id) {
            Ok(result) => result_view(result, "ended early"),
            Err(e) => error_view(e),
        }
    } else if let Some(raw_index) = data.strip_prefix("review_") {
        match raw_index.parse::<usize>() {
            Ok(result_index) => match engine.review(user_id, result_index) {
                Ok(report) => review_view(report),
                Err(e) => error_view(e),
            },
            Err(_) => invalid_selection_view(data),
        }
    } else {
        (welcome_text(&q.from.first_name), main_menu_keyboard())
    };

    show(&bot, &q, text, keyboard).await
}

/// Edit the originating message in place, or send a fresh one when the
/// original is no longer editable.
async fn show(
    bot: &Bot,
    q: &CallbackQuery,
    text: String,
    keyboard: InlineKeyboardMarkup,
) -> HandlerResult {
    if let Some(message) = &q.message {
        let edited = bot
            .edit_message_text(message.chat.id, message.id, text.clone())
            .parse_mode(ParseMode::Html)
            .reply_markup(keyboard.clone())
            .await;
        if edited.is_ok() {
            return Ok(());
        }
        bot.send_message(message.chat.id, text)
            .parse_mode(ParseMode::Html)
            .reply_markup(keyboard)
            .await?;
    } else {
        bot.send_message(ChatId(q.from.id.0 as i64), text)
            .parse_mode(ParseMode::Html)
            .reply_markup(keyboard)
            .await?;
    }
    Ok(())
}

/// Hourly nudge for users who walked away mid-exam. Reads sessions only.
async fn reminder_loop(bot: Bot, engine: Arc<ExamEngine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(3600));
    interval.tick().await; // the first tick fires immediately

    loop {
        interval.tick().await;
        for user_id in engine.users_with_active_exam() {
            let text = "⏰ <b>Exam reminder</b>\n\n\
                        You have an unfinished exam. Head back to continue \
                        or finish it!";
            match bot
                .send_message(ChatId(user_id as i64), text)
                .parse_mode(ParseMode::Html)
                .reply_markup(main_menu_keyboard())
                .await
            {
                Ok(_) => log::info!("Sent exam reminder to user {}", user_id),
                Err(e) => log::warn!("Failed to send reminder to user {}: {}", user_id, e),
            }
        }
    }
}

// exam_<grade>_<subject> / begin_<grade>_<subject>; subject ids may
// themselves contain underscores, the grade id never does.
fn split_exam_payload(payload: &str) -> Option<(&str, &str)> {
    payload.split_once('_')
}

const BACK_TO_MENU: &str = "⬅️ Back to menu";

fn back_to_menu_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
        BACK_TO_MENU,
        "main_menu",
    )]])
}

fn main_menu_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            InlineKeyboardButton::callback("🎓 Take an exam", "take_exam"),
            InlineKeyboardButton::callback("📊 View results", "view_results"),
        ],
        vec![
            InlineKeyboardButton::callback("👤 Profile", "profile"),
            InlineKeyboardButton::callback("❓ Help", "help"),
        ],
    ])
}

fn welcome_text(first_name: &str) -> String {
    format!(
        "🎓 <b>School Exam Bot</b>\n\n\
         Welcome, <b>{}</b>! 👋\n\n\
         • Take interactive exams with instant feedback\n\
         • Track your results and review your answers\n\n\
         Pick an option below to get started:",
        first_name
    )
}

fn help_text() -> String {
    "❓ <b>Help</b>\n\n\
     1. Choose 'Take an exam' and pick your grade and subject\n\
     2. Answer each question within the suggested time\n\
     3. Review your score and explanations afterwards\n\n\
     📚 <b>Commands:</b>\n\
     • /start - main menu\n\
     • /help - this help\n\
     • /profile - your statistics\n\
     • /results - your exam results\n\
     • /clear - reset your exam session"
        .to_string()
}

fn grades_view(engine: &ExamEngine) -> (String, InlineKeyboardMarkup) {
    let grades = engine.grades();
    if grades.is_empty() {
        return (
            "⚠️ <b>No exams available</b>\n\n\
             There are no exams at the moment. Please check back later."
                .to_string(),
            back_to_menu_keyboard(),
        );
    }

    let mut keyboard: Vec<Vec<InlineKeyboardButton>> = grades
        .into_iter()
        .map(|(id, title)| {
            vec![InlineKeyboardButton::callback(
                title,
                format!("grade_{}", id),
            )]
        })
        .collect();
    keyboard.push(vec![InlineKeyboardButton::callback(
        BACK_TO_MENU,
        "main_menu",
    )]);

    (
        "🎓 <b>Available grades</b>\n\n\
         Choose a grade to see its subjects."
            .to_string(),
        InlineKeyboardMarkup::new(keyboard),
    )
}

fn subjects_view(engine: &ExamEngine, grade_id: &str) -> (String, InlineKeyboardMarkup) {
    let (grade_title, subjects) = match engine.subjects(grade_id) {
        Some(found) => found,
        None => {
            return (
                format!("⚠️ Grade '{}' was not found.", grade_id),
                back_to_menu_keyboard(),
            )
        }
    };

    if subjects.is_empty() {
        return (
            format!("⚠️ No subjects are available for {} yet.", grade_title),
            back_to_menu_keyboard(),
        );
    }

    let mut keyboard: Vec<Vec<InlineKeyboardButton>> = subjects
        .into_iter()
        .map(|(id, subject)| {
            vec![InlineKeyboardButton::callback(
                format!("{} ({} min)", subject.title, subject.duration_minutes),
                format!("exam_{}_{}", grade_id, id),
            )]
        })
        .collect();
    keyboard.push(vec![InlineKeyboardButton::callback(
        "⬅️ Back to grades",
        "take_exam",
    )]);

    (
        format!(
            "📚 <b>{} - subjects</b>\n\n\
             Choose a subject to see the exam details:",
            grade_title
        ),
        InlineKeyboardMarkup::new(keyboard),
    )
}

fn overview_view(
    engine: &ExamEngine,
    grade_id: &str,
    subject_id: &str,
) -> (String, InlineKeyboardMarkup) {
    let subject = match engine.subject(grade_id, subject_id) {
        Some(subject) => subject,
        None => {
            return (
                format!(
                    "⚠️ No exam was found for grade '{}', subject '{}'.",
                    grade_id, subject_id
                ),
                back_to_menu_keyboard(),
            )
        }
    };

    let text = format!(
        "📝 <b>Exam: {}</b>\n\n\
         ℹ️ <b>Description:</b> {}\n\
         ⏱️ <b>Duration:</b> {} minutes\n\
         ❓ <b>Questions:</b> {}\n\n\
         Are you ready to begin?",
        subject.title,
        subject.description,
        subject.duration_minutes,
        subject.questions.len()
    );
    let keyboard = InlineKeyboardMarkup::new(vec![
        vec![InlineKeyboardButton::callback(
            "✅ Begin the exam",
            format!("begin_{}_{}", grade_id, subject_id),
        )],
        vec![InlineKeyboardButton::callback(BACK_TO_MENU, "main_menu")],
    ]);
    (text, keyboard)
}

/// The current question, or the final result if the exam just ran out of
/// questions underneath us.
fn question_or_result(
    engine: &ExamEngine,
    user_id: u64,
    reason: &str,
) -> Result<(String, InlineKeyboardMarkup), ExamError> {
    match engine.current_question(user_id) {
        Ok(Prompt::Question(view)) => Ok(question_view(view)),
        Ok(Prompt::EndOfExam) => Ok(result_view(engine.end(user_id)?, reason)),
        Err(e) => Ok(error_view(e)),
    }
}

fn question_view(view: QuestionView) -> (String, InlineKeyboardMarkup) {
    let text = format!(
        "❓ <b>Question {}/{}</b>\n\n{}\n\nChoose an answer:",
        view.ordinal, view.total, view.question.text
    );

    let mut keyboard: Vec<Vec<InlineKeyboardButton>> = view
        .question
        .options
        .iter()
        .enumerate()
        .map(|(i, option)| {
            let letter = (b'A' + i as u8) as char;
            vec![InlineKeyboardButton::callback(
                format!("{}. {}", letter, option),
                format!("answer_{}", i),
            )]
        })
        .collect();
    keyboard.push(vec![InlineKeyboardButton::callback(
        "🏁 Finish the exam",
        "end_exam",
    )]);

    (text, InlineKeyboardMarkup::new(keyboard))
}

fn result_view(result: ExamResult, reason: &str) -> (String, InlineKeyboardMarkup) {
    let text = format!(
        "🏁 <b>Exam finished</b>\n\n\
         📝 <b>Exam:</b> {}\n\
         🎯 <b>Score:</b> {:.1}% ({}/{} correct)\n\
         📅 <b>Date:</b> {}\n\n\
         Reason: {}\n\
         Would you like to review your answers?",
        result.exam_title,
        result.score,
        result.correct,
        result.total,
        result.completed_at.format("%Y-%m-%d %H:%M:%S"),
        reason
    );

    let keyboard = InlineKeyboardMarkup::new(vec![
        vec![InlineKeyboardButton::callback(
            "📋 Review answers",
            "view_results",
        )],
        vec![InlineKeyboardButton::callback(BACK_TO_MENU, "main_menu")],
    ]);
    (text, keyboard)
}

fn review_view(report: ReviewReport) -> (String, InlineKeyboardMarkup) {
    let mut text = format!(
        "📋 <b>Exam review: {}</b>\n\n\
         🎯 <b>Score:</b> {:.1}% ({}/{} correct)\n\
         📅 <b>Date:</b> {}\n\n\
         <b>Answer details:</b>\n",
        report.result.exam_title,
        report.result.score,
        report.result.correct,
        report.result.total,
        report.result.completed_at.format("%Y-%m-%d %H:%M:%S"),
    );

    for entry in &report.entries {
        let status = if entry.is_correct {
            "✅ Correct"
        } else {
            "❌ Incorrect"
        };
        text.push_str(&format!(
            "❓ <b>Question {}:</b> {}\n\
             📝 <b>Your answer:</b> {}\n\
             ✅ <b>Correct answer:</b> {}\n",
            entry.ordinal, entry.question, entry.your_answer, entry.correct_answer
        ));
        if let Some(explanation) = &entry.explanation {
            text.push_str(&format!("ℹ️ <b>Explanation:</b> {}\n", explanation));
        }
        text.push_str(&format!("{}\n\n", status));
    }

    if report.unavailable > 0 {
        text.push_str(&format!(
            "⚠️ {} answer(s) refer to questions that are no longer available.\n",
            report.unavailable
        ));
    }

    let keyboard = InlineKeyboardMarkup::new(vec![
        vec![InlineKeyboardButton::callback(BACK_TO_MENU, "main_menu")],
        vec![InlineKeyboardButton::callback(
            "🎯 Take another exam",
            "take_exam",
        )],
    ]);
    (text, keyboard)
}

fn results_view(engine: &ExamEngine, user_id: u64) -> (String, InlineKeyboardMarkup) {
    let history = engine.history(user_id);
    if history.is_empty() {
        return (
            "📊 <b>Your exam results</b>\n\n\
             🔍 No results yet. Take your first exam to see them here!"
                .to_string(),
            InlineKeyboardMarkup::new(vec![
                vec![InlineKeyboardButton::callback(
                    "🎯 Take your first exam",
                    "take_exam",
                )],
                vec![InlineKeyboardButton::callback(BACK_TO_MENU, "main_menu")],
            ]),
        );
    }

    let stats = engine.profile(user_id);
    let mut text = format!(
        "📊 <b>Your exam results</b>\n\n\
         🎯 <b>Overview:</b>\n\
         • Total exams: <b>{}</b>\n\
         • Average score: <b>{:.1}%</b>\n\
         • Best score: <b>{:.1}%</b>\n\n\
         📈 <b>Recent results:</b>\n",
        stats.total_exams, stats.average_score, stats.best_score
    );

    for result in history.iter().rev().take(5) {
        text.push_str(&format!(
            "• {}: <b>{:.1}%</b> ({})\n",
            result.exam_title,
            result.score,
            result.completed_at.format("%Y-%m-%d")
        ));
    }

    // review buttons for the three most recent attempts
    let mut keyboard: Vec<Vec<InlineKeyboardButton>> = history
        .iter()
        .enumerate()
        .rev()
        .take(3)
        .map(|(index, result)| {
            vec![InlineKeyboardButton::callback(
                format!("📋 Review: {}", result.exam_title),
                format!("review_{}", index),
            )]
        })
        .collect();
    keyboard.push(vec![InlineKeyboardButton::callback(
        BACK_TO_MENU,
        "main_menu",
    )]);

    (text, InlineKeyboardMarkup::new(keyboard))
}

fn profile_view(engine: &ExamEngine, user_id: u64) -> (String, InlineKeyboardMarkup) {
    let stats = engine.profile(user_id);
    let text = format!(
        "👤 <b>Student profile</b>\n\n\
         📊 <b>Progress:</b>\n\
         • Total exams: <b>{}</b>\n\
         • Subjects taken: <b>{}</b>\n\
         • Average score: <b>{:.1}%</b>\n\
         • Best score: <b>{:.1}%</b>",
        stats.total_exams, stats.subjects_taken, stats.average_score, stats.best_score
    );
    let keyboard = InlineKeyboardMarkup::new(vec![
        vec![InlineKeyboardButton::callback(
            "📊 View all results",
            "view_results",
        )],
        vec![InlineKeyboardButton::callback(BACK_TO_MENU, "main_menu")],
    ]);
    (text, keyboard)
}

fn invalid_selection_view(data: &str) -> (String, InlineKeyboardMarkup) {
    log::warn!("Unparseable callback data: {}", data);
    (
        "⚠️ That selection is not valid. Please try again.".to_string(),
        back_to_menu_keyboard(),
    )
}

fn error_view(e: ExamError) -> (String, InlineKeyboardMarkup) {
    let text = if e.is_storage() {
        log::error!("Storage failure surfaced to a handler: {}", e);
        "⚠️ A system error occurred. Please try again later.".to_string()
    } else {
        format!("⚠️ {}.", e)
    };
    (text, back_to_menu_keyboard())
}
