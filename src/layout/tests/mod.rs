mod record;
mod undo_page;
