use tokio::sync::mpsc;
use tracing::*;

use crate::rcon::codec::{escape, DELIMITER};

/// Handle used to queue outbound protocol verbs. Sending never blocks; the
/// connection loop drains the queue onto the socket.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<String>,
}

impl Outbound {
    pub fn channel() -> (Outbound, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Outbound { tx }, rx)
    }

    fn send(&self, line: String) {
        if self.tx.send(line).is_err() {
            warn!("Outbound queue closed, dropping command");
        }
    }

    pub fn raw(&self, line: &str) {
        self.send(line.to_string());
    }

    pub fn auth(&self, password: &str) {
        self.send(format!("cauth {}", escape(password, DELIMITER)));
    }

    pub fn subscribe(&self, user: &str) {
        self.send(format!("csubscribe {}", escape(user, DELIMITER)));
    }

    pub fn ping(&self) {
        self.send("cping".to_string());
    }

    pub fn change_map(&self, map: &str) {
        self.send(format!("changemap {}", escape(map, DELIMITER)));
    }

    pub fn kick(&self, pid: u32, reason: &str) {
        self.send(format!("ckick pid{} {}", pid, escape(reason, DELIMITER)));
    }

    pub fn kick_ban(&self, pid: u32, reason: &str) {
        self.send(format!("ckickban pid{} {}", pid, escape(reason, DELIMITER)));
    }

    pub fn mute(&self, pid: u32) {
        self.send(format!("cmute pid{}", pid));
    }

    pub fn unmute(&self, pid: u32) {
        self.send(format!("cunmute pid{}", pid));
    }

    pub fn mine_ban(&self, pid: u32) {
        self.send(format!("cmineban pid{}", pid));
    }

    pub fn host_say(&self, message: &str) {
        self.send(format!("chostsay {}", escape(message, DELIMITER)));
    }

    pub fn host_private_say(&self, pid: u32, message: &str) {
        self.send(format!("chostprivatesay pid{} {}", pid, escape(message, DELIMITER)));
    }

    pub fn server_info(&self) {
        self.send("cserverinfo".to_string());
    }

    pub fn game_info(&self) {
        self.send("cgameinfo".to_string());
    }

    pub fn mutator_list(&self) {
        self.send("cmutatorlist".to_string());
    }

    pub fn rotation_list(&self) {
        self.send("crotationlist".to_string());
    }

    pub fn client_var_list(&self, fields: &[&str]) {
        self.send(format!("cclientvarlist {}", fields.join(" ")));
    }

    pub fn building_list(&self) {
        self.send("cbuildinglist".to_string());
    }

    pub fn init_done(&self) {
        self.send("cinitdone".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_are_formatted() {
        let (out, mut rx) = Outbound::channel();
        out.kick(7, "you were banned");
        out.ping();
        out.client_var_list(&["id", "name", "team", "score", "credits"]);
        assert_eq!(rx.try_recv().unwrap(), "ckick pid7 you were banned");
        assert_eq!(rx.try_recv().unwrap(), "cping");
        assert_eq!(rx.try_recv().unwrap(), "cclientvarlist id name team score credits");
    }

    #[test]
    fn user_text_is_escaped() {
        let (out, mut rx) = Outbound::channel();
        out.host_say("line one\nline two\u{2}x");
        let line = rx.try_recv().unwrap();
        assert!(!line.contains('\n'));
        assert!(!line.contains('\u{2}'));
        assert_eq!(line, "chostsay line one\\nline two\\x02x");
    }
}
