/*
 * smtpd - embeddable SMTP server
 * Copyright (C) 2022 the smtpd developers
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 *  This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/

//! Message parsing against a corpus of real-world message shapes: a bare
//! HTML body, multipart/alternative, an attachment inside multipart/mixed,
//! and a body with corrupt transfer encoding.

use pretty_assertions::assert_eq;

use smtpd::{ContentType, Message};

const PLAIN_HTML_EMAIL: &str = r#"From: Sender <sender@example.com>
Date: Mon, 16 Jan 2017 16:59:33 -0500
Subject: Multipart Message
MIME-Version: 1.0
Content-Type: text/html
To: recipient1@example.com, "Recipient 2" <recipient2@example.com>
Message-ID: <examplemessage@example.com>
Content-Transfer-Encoding: quoted-printable

<!DOCTYPE html>
<html>
  <body>
    Sending bees<br><br>=F0=9F=90=9D
  </body>
</html>"#;

const ALTERNATIVE_EMAIL: &str = r#"From: Sender <sender@example.com>
Date: Mon, 16 Jan 2017 16:59:33 -0500
Subject: Multipart Message
MIME-Version: 1.0
Content-Type: multipart/alternative;
 	 boundary="_=test=_bbd1e98aa6c34ef59d8d102a0e795027"
To: recipient1@example.com, "Recipient 2" <recipient2@example.com>
Message-ID: <examplemessage@example.com>

--_=test=_bbd1e98aa6c34ef59d8d102a0e795027
Content-Type: text/plain; charset="UTF-8"
Content-Transfer-Encoding: quoted-printable

Sending bees

=F0=9F=90=9D

--_=test=_bbd1e98aa6c34ef59d8d102a0e795027
Content-Type: text/html; charset="UTF-8"
Content-Transfer-Encoding: quoted-printable

<!DOCTYPE html>
<html>
  <body>
    Sending bees<br><br>=F0=9F=90=9D
  </body>
</html>

--_=test=_bbd1e98aa6c34ef59d8d102a0e795027--
"#;

const EMAIL_WITH_ATTACHMENT: &str = r#"From: Sender <sender@example.com>
Date: Mon, 16 Jan 2017 16:59:33 -0500
Subject: Multipart Message
MIME-Version: 1.0
Content-Type: multipart/mixed;
 	 boundary="_=test=_bbd1e98aa6c34ef59d8d102a0e795027"
To: recipient1@example.com, "Recipient 2" <recipient2@example.com>
Message-ID: <examplemessage@example.com>

--_=test=_bbd1e98aa6c34ef59d8d102a0e795027
Content-Type: multipart/alternative; boundary="_=ALT_=test=_bbd1e98aa6c34ef59d8d102a0e795027"

--_=ALT_=test=_bbd1e98aa6c34ef59d8d102a0e795027
Content-Type: text/plain; charset="UTF-8"
Content-Transfer-Encoding: quoted-printable

Sending bees

=F0=9F=90=9D

--_=ALT_=test=_bbd1e98aa6c34ef59d8d102a0e795027
Content-Type: text/html; charset="UTF-8"
Content-Transfer-Encoding: quoted-printable

<!DOCTYPE html>
<html>
  <body>
    Sending bees<br><br>=F0=9F=90=9D
  </body>
</html>

--_=ALT_=test=_bbd1e98aa6c34ef59d8d102a0e795027--
--_=test=_bbd1e98aa6c34ef59d8d102a0e795027
Content-Type: text/calendar; name="invite.ics"
Content-Transfer-Encoding: base64
Content-Disposition: attachment; filename="invite.ics"

QkVHSU46VkNBTEVOREFSClZFUlNJT046Mi4wClBST0RJRDotLy9tYWlscHJvdG8vL01haWxQcm90bwpDQUxTQ0FMRTpHUkVHT1JJQU4KQkVHSU46VkVWRU5UCkRUU1RBTVA6MjAxNzAxMTZUMTU0MDAwClVJRDpteWNvb2xldmVudEBtYWlscHJvdG8KCkRUU1RBUlQ7VFpJRD0iQW1lcmljYS9OZXdfWW9yayI6MjAxNzAxMThUMTEwMDAwCkRURU5EO1RaSUQ9IkFtZXJpY2EvTmV3X1lvcmsiOjIwMTcwMTE4VDEyMDAwMApTVU1NQVJZOlNlbmQgYW4gZW1haWwKTE9DQVRJT046VGVzdApFTkQ6VkVWRU5UCkVORDpWQ0FMRU5EQVI=
--_=test=_bbd1e98aa6c34ef59d8d102a0e795027--"#;

const EMAIL_WITH_INVALID_BODY: &str = r#"From: Sender <sender@example.com>
Date: Mon, 16 Jan 2017 16:59:33 -0500
Subject: Invalid Body Message
MIME-Version: 1.0
Content-Type: text/html
To: recipient1@example.com, "Recipient 2" <recipient2@example.com>
Message-ID: <examplemessage@example.com>
Content-Transfer-Encoding: quoted-printable

<!DOCTYPE html>
<html>
  <body>
    Sending bees<br><br>=FG=XX==
  </body>
</html>"#;

const EXPECTED_HTML: &str = "<!DOCTYPE html>\n<html>\n  <body>\n    Sending bees<br><br>\u{1F41D}\n  </body>\n</html>";
const EXPECTED_PLAIN: &str = "Sending bees\n\n\u{1F41D}";

fn assert_corpus_recipients(message: &Message) {
    assert_eq!(message.to.len(), 2);
    assert_eq!(message.to[0].address, "recipient1@example.com");
    assert_eq!(message.to[0].name, None);
    assert_eq!(message.to[1].address, "recipient2@example.com");
    assert_eq!(message.to[1].name.as_deref(), Some("Recipient 2"));
}

#[test]
fn plain_html_parsing() {
    let message = Message::new(PLAIN_HTML_EMAIL.as_bytes(), vec![]).unwrap();

    assert_corpus_recipients(&message);
    assert_eq!(message.from.address, "sender@example.com");
    assert_eq!(message.from.name.as_deref(), Some("Sender"));
    assert_eq!(message.subject, "Multipart Message");
    assert_eq!(message.id(), "<examplemessage@example.com>");

    let html = message.html().unwrap();
    assert_eq!(String::from_utf8(html).unwrap().trim(), EXPECTED_HTML);

    message
        .plain()
        .expect_err("a pure HTML message has no plain-text version");
}

#[test]
fn alternative_message_parsing() {
    let message = Message::new(ALTERNATIVE_EMAIL.as_bytes(), vec![]).unwrap();

    assert_corpus_recipients(&message);

    let html = message.html().unwrap();
    assert_eq!(String::from_utf8(html).unwrap().trim(), EXPECTED_HTML);

    let plain = message.plain().unwrap();
    assert_eq!(String::from_utf8(plain).unwrap().trim(), EXPECTED_PLAIN);
}

#[test]
fn mixed_message_with_attachment() {
    let message = Message::new(EMAIL_WITH_ATTACHMENT.as_bytes(), vec![]).unwrap();

    assert_corpus_recipients(&message);

    // the alternative section is one level below the mixed root
    let html = message.html().unwrap();
    assert_eq!(String::from_utf8(html).unwrap().trim(), EXPECTED_HTML);
    let plain = message.plain().unwrap();
    assert_eq!(String::from_utf8(plain).unwrap().trim(), EXPECTED_PLAIN);

    let attachments = message.attachments().unwrap();
    assert_eq!(attachments.len(), 1);

    let content_type =
        ContentType::parse(attachments[0].headers.get("Content-Type").unwrap()).unwrap();
    assert_eq!(content_type.media_type, "text/calendar");

    let body = String::from_utf8(attachments[0].body.clone()).unwrap();
    assert!(body.starts_with("BEGIN:VCALENDAR\nVERSION:2.0"));
    assert!(body.ends_with("END:VEVENT\nEND:VCALENDAR"));
}

#[test]
fn invalid_body_still_builds_a_message() {
    let message = Message::new(EMAIL_WITH_INVALID_BODY.as_bytes(), vec![]).unwrap();

    // the envelope stays readable even though the body cannot be decoded
    assert_corpus_recipients(&message);
    assert_eq!(message.subject, "Invalid Body Message");

    message
        .parts()
        .expect_err("corrupt quoted-printable must fail the lazy parse");
    message
        .html()
        .expect_err("body accessors surface the same parse failure");
}

#[test]
fn parts_tree_shape_of_the_mixed_message() {
    let message = Message::new(EMAIL_WITH_ATTACHMENT.as_bytes(), vec![]).unwrap();
    let parts = message.parts().unwrap();

    // mixed root: [alternative(plain, html), calendar]
    assert_eq!(parts.len(), 2);
    assert_eq!(
        parts[0].content_type().unwrap().media_type,
        "multipart/alternative"
    );
    assert_eq!(parts[0].children.len(), 2);
    assert!(parts[0].children.iter().all(|child| child.children.is_empty()));
    assert_eq!(
        parts[1].content_type().unwrap().media_type,
        "text/calendar"
    );
    assert!(parts[1].children.is_empty());
}
